//! Error types for the log echo server.
//!
//! Setup failures (`ServerError`) are fatal and end the process with a
//! non-zero status. Connection failures (`ConnectionError`) only end the
//! connection they occurred on.

use std::collections::TryReserveError;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}", path = .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}", path = .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
}

/// Fatal setup errors.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to listen: {0}")]
    Listen(#[source] std::io::Error),

    #[error("Failed to daemonize: {0}")]
    Daemonize(#[source] std::io::Error),

    #[error("Failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a single connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("recv failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("append to data file failed: {0}")]
    Append(#[source] std::io::Error),

    #[error("read back of data file failed: {0}")]
    ReadBack(#[source] std::io::Error),

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
}

/// Reasons a reassembly buffer could not grow.
#[derive(Error, Debug)]
pub enum GrowthError {
    #[error("{needed} bytes exceeds the buffer limit of {limit}")]
    Limit { needed: usize, limit: usize },

    #[error("allocation failed: {0}")]
    Alloc(#[from] TryReserveError),
}

/// Result type for setup operations.
pub type Result<T> = std::result::Result<T, ServerError>;
