//! TCP listener and accept loop.
//!
//! The listening socket is bound before daemonizing and put into the
//! listening state afterwards. Accepted connections are either served
//! inline (sequential mode) or spawned onto their own task (concurrent
//! mode). When the shutdown flag is raised the loop stops accepting,
//! closes the listener, waits for in-flight connections to unwind and
//! unlinks the data file.

use crate::config::{Config, DispatchMode};
use crate::connection::{handle_connection, CloseReason, ConnectionSettings, ConnectionSummary};
use crate::error::{Result, ServerError};
use crate::journal::Journal;
use crate::shutdown::Shutdown;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Create a socket bound to `addr` but not yet listening.
///
/// A wildcard IPv6 address accepts IPv4 peers too. If the host has no IPv6
/// support the IPv4 wildcard on the same port is used instead.
pub fn bind(addr: SocketAddr) -> Result<Socket> {
    match bind_socket(addr) {
        Ok(socket) => Ok(socket),
        Err(e) if addr.is_ipv6() && addr.ip().is_unspecified() && ipv6_unavailable(&e) => {
            let fallback = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port());
            warn!(error = %e, %fallback, "IPv6 unavailable, binding IPv4 only");
            bind_socket(fallback).map_err(|source| ServerError::Bind {
                addr: fallback,
                source,
            })
        }
        Err(source) => {
            error!(%addr, error = %source, "server: bind");
            Err(ServerError::Bind { addr, source })
        }
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn ipv6_unavailable(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::AddrNotAvailable
        || e.raw_os_error() == Some(libc::EAFNOSUPPORT)
        || e.raw_os_error() == Some(libc::EPROTONOSUPPORT)
}

/// Put a bound socket into the listening state.
pub fn listen(socket: Socket, backlog: i32) -> Result<std::net::TcpListener> {
    socket.listen(backlog).map_err(|e| {
        error!(error = %e, "listen");
        ServerError::Listen(e)
    })?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Server instance
pub struct Server {
    mode: DispatchMode,
    settings: ConnectionSettings,
    journal: Arc<Journal>,
    shutdown: Shutdown,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: &Config, shutdown: Shutdown) -> Self {
        Server {
            mode: config.mode,
            settings: ConnectionSettings::from_config(config),
            journal: Arc::new(Journal::from_config(config)),
            shutdown,
        }
    }

    /// Accept connections on `listener` until shutdown is raised.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn run(&self, listener: std::net::TcpListener) -> Result<()> {
        let listener = TcpListener::from_std(listener)?;
        info!(
            address = %listener.local_addr()?,
            mode = ?self.mode,
            data_file = %self.journal.path().display(),
            "server: waiting for connections..."
        );

        let mut connections = JoinSet::new();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    reap(finished);
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept");
                    continue;
                }
            };

            let connection = handle_connection(
                stream,
                peer,
                Arc::clone(&self.journal),
                self.shutdown.clone(),
                self.settings,
            );
            match self.mode {
                DispatchMode::Sequential => log_summary(&connection.await),
                DispatchMode::Concurrent => {
                    connections.spawn(connection);
                }
            }
        }

        drop(listener);
        info!(in_flight = connections.len(), "Stopped accepting connections");

        while let Some(finished) = connections.join_next().await {
            reap(finished);
        }

        if let Err(e) = self.journal.remove().await {
            error!(path = %self.journal.path().display(), error = %e, "Failed to remove data file");
        }
        Ok(())
    }
}

fn reap(finished: std::result::Result<ConnectionSummary, JoinError>) {
    match finished {
        Ok(summary) => log_summary(&summary),
        Err(e) => warn!(error = %e, "Connection task failed"),
    }
}

fn log_summary(summary: &ConnectionSummary) {
    match &summary.reason {
        CloseReason::Error(e) => debug!(packets = summary.packets, error = %e, "Connection aborted"),
        reason => debug!(packets = summary.packets, ?reason, "Connection done"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        addr: SocketAddr,
        shutdown: Shutdown,
        data_file: PathBuf,
        task: JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    fn test_config(dir: &tempfile::TempDir, mode: DispatchMode) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            backlog: 10,
            mode,
            daemon: false,
            initial_buffer: 8,
            read_chunk: 4,
            max_buffer: None,
            data_file: dir.path().join("packets"),
            file_mode: 0o644,
            fsync: false,
            log_level: "debug".to_string(),
            syslog: false,
        }
    }

    fn start(mode: DispatchMode) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, mode);
        let listener = listen(bind(config.listen).unwrap(), config.backlog).unwrap();
        let addr = listener.local_addr().unwrap();

        let shutdown = Shutdown::new();
        let server = Server::new(&config, shutdown.clone());
        let task = tokio::spawn(async move { server.run(listener).await });

        Harness {
            addr,
            shutdown,
            data_file: config.data_file,
            task,
            _dir: dir,
        }
    }

    async fn send_and_expect(client: &mut TcpStream, send: &[u8], expect: &[u8]) {
        client.write_all(send).await.unwrap();
        let mut buf = vec![0u8; expect.len()];
        tokio::time::timeout(TIMEOUT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, expect);
    }

    async fn stop(harness: Harness) -> PathBuf {
        harness.shutdown.trigger();
        tokio::time::timeout(TIMEOUT, harness.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        harness.data_file
    }

    #[test]
    fn test_bind_and_listen_loopback() {
        let listener = listen(bind("127.0.0.1:0".parse().unwrap()).unwrap(), 10).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let first = listen(bind("127.0.0.1:0".parse().unwrap()).unwrap(), 10).unwrap();
        let taken = first.local_addr().unwrap();
        assert!(matches!(bind(taken), Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_hello_world_session() {
        let harness = start(DispatchMode::Sequential);
        let mut client = TcpStream::connect(harness.addr).await.unwrap();

        send_and_expect(&mut client, b"hello\n", b"hello\n").await;
        send_and_expect(&mut client, b"world\n", b"hello\nworld\n").await;

        drop(client);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_partial_packet_stays_buffered() {
        let harness = start(DispatchMode::Concurrent);
        let mut client = TcpStream::connect(harness.addr).await.unwrap();

        client.write_all(b"ab").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        send_and_expect(&mut client, b"c\nd", b"abc\n").await;

        // "d" has no delimiter yet, so nothing else arrives.
        let mut extra = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), client.read(&mut extra))
                .await
                .is_err()
        );

        send_and_expect(&mut client, b"e\n", b"abc\nde\n").await;
        drop(client);
        stop(harness).await;
    }

    #[tokio::test]
    async fn test_sequential_clients_share_log() {
        let harness = start(DispatchMode::Sequential);

        let mut first = TcpStream::connect(harness.addr).await.unwrap();
        send_and_expect(&mut first, b"one\n", b"one\n").await;
        drop(first);

        let mut second = TcpStream::connect(harness.addr).await.unwrap();
        send_and_expect(&mut second, b"two\n", b"one\ntwo\n").await;
        drop(second);

        stop(harness).await;
    }

    #[tokio::test]
    async fn test_concurrent_clients_each_see_own_commit() {
        let harness = start(DispatchMode::Concurrent);

        let mut a = TcpStream::connect(harness.addr).await.unwrap();
        let mut b = TcpStream::connect(harness.addr).await.unwrap();

        let (echo_a, echo_b) = tokio::join!(
            async {
                a.write_all(b"from-a\n").await.unwrap();
                read_echo(&mut a, b"from-a\n").await
            },
            async {
                b.write_all(b"from-b\n").await.unwrap();
                read_echo(&mut b, b"from-b\n").await
            }
        );
        // The later commit's echo holds both packets, the earlier one only its own.
        let (short, long) = if echo_a.len() < echo_b.len() {
            (echo_a, echo_b)
        } else {
            (echo_b, echo_a)
        };
        assert_eq!(short.len(), 7);
        assert_eq!(long.len(), 14);
        assert!(long.starts_with(&short));

        drop(a);
        drop(b);
        stop(harness).await;
    }

    /// Read until the echoed log ends with `packet`, returning everything read.
    async fn read_echo(stream: &mut TcpStream, packet: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while !out.ends_with(packet) {
            let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "server closed early");
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_shutdown_removes_data_file_and_stops_accepting() {
        let harness = start(DispatchMode::Concurrent);
        let addr = harness.addr;

        let mut client = TcpStream::connect(addr).await.unwrap();
        send_and_expect(&mut client, b"keep me\n", b"keep me\n").await;
        assert!(harness.data_file.exists());

        // The idle client must not hold the server open.
        let data_file = stop(harness).await;
        assert!(!data_file.exists());

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_sequential_handler() {
        let harness = start(DispatchMode::Sequential);
        let _client = TcpStream::connect(harness.addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let data_file = stop(harness).await;
        assert!(!data_file.exists());
    }
}
