//! Per-connection state machine.
//!
//! ```text
//! Accepted -> Reading -> (Committing -> Sending)* -> Closing -> Done
//! ```
//!
//! Each connection owns its stream and its reassembly buffer; the only
//! thing shared with other connections is the journal. The shutdown flag
//! is checked at every state boundary and raced against every blocking
//! read or write.

use crate::config::Config;
use crate::error::ConnectionError;
use crate::journal::Journal;
use crate::protocol::{self, SendOutcome};
use crate::reassembler::Reassembler;
use crate::shutdown::Shutdown;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, trace};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Stream established, buffer empty.
    Accepted,
    /// Waiting for the next chunk from the peer.
    Reading,
    /// Appending a complete packet to the journal.
    Committing,
    /// Writing the journal snapshot back to the peer.
    Sending,
    /// Releasing the buffer and the stream.
    Closing,
    /// All resources released.
    Done,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer performed an orderly close.
    PeerClosed,
    /// The shutdown flag was observed.
    Shutdown,
    /// An I/O or journal error aborted the connection.
    Error(ConnectionError),
}

/// Outcome of a finished connection.
#[derive(Debug)]
pub struct ConnectionSummary {
    /// Packets committed and echoed in full.
    pub packets: usize,
    /// Bytes left in the reassembly buffer when the connection closed.
    pub discarded: usize,
    pub reason: CloseReason,
    /// State the connection finished in.
    pub state: ConnState,
}

/// Buffer sizing for a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Initial reassembly buffer capacity.
    pub initial_buffer: usize,
    /// Bytes requested per read.
    pub read_chunk: usize,
    /// Reassembly buffer limit; `None` for unbounded.
    pub max_buffer: Option<usize>,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_buffer: config.initial_buffer,
            read_chunk: config.read_chunk,
            max_buffer: config.max_buffer,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            initial_buffer: 1024,
            read_chunk: 1024,
            max_buffer: None,
        }
    }
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    /// Peer IP in display form.
    peer: String,
    state: ConnState,
    reassembler: Reassembler,
    read_chunk: usize,
    packets: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection in the `Accepted` state.
    pub fn new(stream: S, peer: impl Into<String>, settings: ConnectionSettings) -> Self {
        Self {
            stream,
            peer: peer.into(),
            state: ConnState::Accepted,
            reassembler: Reassembler::with_limit(
                settings.initial_buffer,
                settings.max_buffer.unwrap_or(usize::MAX),
            ),
            read_chunk: settings.read_chunk.max(1),
            packets: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Drive the connection until the peer closes, an error occurs or shutdown is raised.
    pub async fn run(mut self, journal: &Journal, shutdown: &Shutdown) -> ConnectionSummary {
        let reason = self.exchange(journal, shutdown).await;
        self.close(reason).await
    }

    /// Read, reassemble, commit and echo until something ends the connection.
    async fn exchange(&mut self, journal: &Journal, shutdown: &Shutdown) -> CloseReason {
        let mut scratch = vec![0u8; self.read_chunk];

        loop {
            self.transition(ConnState::Reading);
            if shutdown.is_triggered() {
                return CloseReason::Shutdown;
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.wait() => return CloseReason::Shutdown,
                result = self.stream.read(&mut scratch) => result,
            };

            let n = match result {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(peer = %self.peer, error = %e, "recv");
                    return CloseReason::Error(ConnectionError::Receive(e));
                }
            };
            trace!(peer = %self.peer, bytes = n, "Received");

            for packet in self.reassembler.feed(&scratch[..n]) {
                if shutdown.is_triggered() {
                    return CloseReason::Shutdown;
                }

                self.transition(ConnState::Committing);
                let snapshot = match journal.commit(&packet).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        error!(peer = %self.peer, error = %e, "Commit failed");
                        return CloseReason::Error(e);
                    }
                };

                self.transition(ConnState::Sending);
                match protocol::echo(&mut self.stream, &snapshot, shutdown).await {
                    Ok(SendOutcome::Complete) => self.packets += 1,
                    Ok(SendOutcome::Cancelled) => return CloseReason::Shutdown,
                    Err(e) => {
                        error!(peer = %self.peer, error = %e, "send");
                        return CloseReason::Error(e);
                    }
                }
            }
        }
    }

    /// Release the buffer and the stream.
    async fn close(mut self, reason: CloseReason) -> ConnectionSummary {
        self.transition(ConnState::Closing);

        let discarded = self.reassembler.pending().len();
        let buffer_capacity = self.reassembler.capacity();
        if discarded > 0 {
            debug!(peer = %self.peer, bytes = discarded, "Discarding unterminated data");
        }
        drop(self.reassembler);

        if !matches!(reason, CloseReason::Error(_)) {
            if let Err(e) = self.stream.shutdown().await {
                trace!(peer = %self.peer, error = %e, "Stream shutdown failed");
            }
        }
        drop(self.stream);

        info!("Closed connection from {}", self.peer);
        debug!(
            peer = %self.peer,
            packets = self.packets,
            buffer_capacity,
            ?reason,
            "Connection finished"
        );
        trace!(peer = %self.peer, from = ?self.state, to = ?ConnState::Done, "State change");
        self.state = ConnState::Done;

        ConnectionSummary {
            packets: self.packets,
            discarded,
            reason,
            state: self.state,
        }
    }

    fn transition(&mut self, next: ConnState) {
        if self.state != next {
            trace!(peer = %self.peer, from = ?self.state, to = ?next, "State change");
            self.state = next;
        }
    }
}

/// Serve one accepted TCP connection to completion.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    journal: Arc<Journal>,
    shutdown: Shutdown,
    settings: ConnectionSettings,
) -> ConnectionSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = peer_ip(&peer);
    info!("Accepted connection from {}", peer);
    Connection::new(stream, peer, settings)
        .run(&journal, &shutdown)
        .await
}

/// Peer IP in the form used by connection notices.
///
/// IPv4 clients of a dual-stack listener show up as IPv4-mapped IPv6
/// addresses; those are reported in plain IPv4 form.
pub fn peer_ip(addr: &SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}
