//! Configuration module for the logecho server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// How accepted connections are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Serve one connection to completion before accepting the next.
    Sequential,
    /// Spawn a task per accepted connection.
    Concurrent,
}

/// Command-line arguments for the log echo server
#[derive(Parser, Debug, Default)]
#[command(name = "logecho")]
#[command(author = "logecho authors")]
#[command(version = "0.1.0")]
#[command(about = "Appends newline-delimited packets to a log and echoes the log back", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Detach from the controlling terminal and run as a daemon
    #[arg(short, long)]
    pub daemon: bool,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Connection scheduling mode
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<DispatchMode>,

    /// Path of the packet data file
    #[arg(short = 'f', long)]
    pub data_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Send diagnostics to syslog instead of stderr
    #[arg(long)]
    pub syslog: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Connection scheduling mode
    #[serde(default = "default_mode")]
    pub mode: DispatchMode,
    /// Run as a daemon
    #[serde(default)]
    pub daemon: bool,
    /// Initial capacity of each connection's reassembly buffer
    #[serde(default = "default_chunk")]
    pub initial_buffer: usize,
    /// Bytes requested from the socket per read
    #[serde(default = "default_chunk")]
    pub read_chunk: usize,
    /// Largest reassembly buffer a connection may grow to; unbounded if unset
    #[serde(default)]
    pub max_buffer: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            mode: default_mode(),
            daemon: false,
            initial_buffer: default_chunk(),
            read_chunk: default_chunk(),
            max_buffer: None,
        }
    }
}

/// Data file configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Location of the packet data file
    #[serde(default = "default_data_file")]
    pub data_file: PathBuf,
    /// Permission bits used when creating the data file
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    /// Sync file data to disk after every append
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            file_mode: default_file_mode(),
            fsync: default_fsync(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Send diagnostics to syslog
    #[serde(default)]
    pub syslog: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            syslog: false,
        }
    }
}

fn default_listen() -> String {
    "[::]:9000".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_mode() -> DispatchMode {
    DispatchMode::Concurrent
}

fn default_chunk() -> usize {
    1024
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_file_mode() -> u32 {
    0o644
}

fn default_fsync() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub mode: DispatchMode,
    pub daemon: bool,
    pub initial_buffer: usize,
    pub read_chunk: usize,
    pub max_buffer: Option<usize>,
    pub data_file: PathBuf,
    pub file_mode: u32,
    pub fsync: bool,
    pub log_level: String,
    pub syslog: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name, if any.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;
        let daemon = cli.daemon || toml_config.server.daemon;

        Ok(Config {
            listen,
            backlog: toml_config.server.backlog,
            mode: cli.mode.unwrap_or(toml_config.server.mode),
            daemon,
            initial_buffer: toml_config.server.initial_buffer.max(1),
            read_chunk: toml_config.server.read_chunk.max(1),
            max_buffer: toml_config.server.max_buffer,
            data_file: cli.data_file.unwrap_or(toml_config.storage.data_file),
            file_mode: toml_config.storage.file_mode,
            fsync: toml_config.storage.fsync,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            // A daemon has no terminal left to write to.
            syslog: cli.syslog || toml_config.logging.syslog || daemon,
        })
    }
}
