//! logecho: a newline packet log server
//!
//! Clients send newline-terminated packets over TCP. Every complete packet
//! is appended to a data file shared by all clients, and after each one the
//! whole file is sent back to the client that produced it.
//!
//! Features:
//! - Packets of any length, reassembled across arbitrary TCP chunking
//! - Sequential or task-per-connection scheduling
//! - Graceful shutdown on SIGINT/SIGTERM, removing the data file
//! - Optional daemon mode with syslog diagnostics
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod journal;
pub mod logging;
pub mod protocol;
pub mod reassembler;
pub mod server;
pub mod shutdown;
