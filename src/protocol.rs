//! Echo-on-commit protocol.
//!
//! Wire format:
//!
//! ```text
//! Client: <bytes>\n              (any length, no escaping)
//! Server: <entire data file>     (raw, no extra framing)
//!
//! Example:
//! Client: hello\n      Server: hello\n
//! Client: world\n      Server: hello\nworld\n
//! ```
//!
//! Every complete packet is appended to the shared journal, then the
//! journal's full contents are written back to the connection that sent it.
//! The journal hands out the snapshot (see `Journal::commit`); this module
//! owns getting it onto the wire.

use crate::error::ConnectionError;
use crate::shutdown::Shutdown;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// How a send finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte was handed to the transport.
    Complete,
    /// Shutdown was raised before the send finished.
    Cancelled,
}

/// Echo a journal snapshot back to the committing connection.
pub async fn echo<W>(
    writer: &mut W,
    snapshot: &[u8],
    shutdown: &Shutdown,
) -> Result<SendOutcome, ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let outcome = send_all(writer, snapshot, shutdown)
        .await
        .map_err(ConnectionError::Send)?;
    trace!(bytes = snapshot.len(), ?outcome, "Echoed data file");
    Ok(outcome)
}

/// Write all of `data`, looping over short writes.
///
/// Interrupted writes are retried. Shutdown is checked before every write
/// and raced against any write that blocks.
pub async fn send_all<W>(writer: &mut W, data: &[u8], shutdown: &Shutdown) -> io::Result<SendOutcome>
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    while sent < data.len() {
        if shutdown.is_triggered() {
            return Ok(SendOutcome::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.wait() => return Ok(SendOutcome::Cancelled),
            result = writer.write(&data[sent..]) => result,
        };

        match result {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    writer.flush().await?;
    Ok(SendOutcome::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Writer that accepts at most `limit` bytes per call and fails once on request.
    struct TrickleWriter {
        written: Vec<u8>,
        limit: usize,
        interrupt_first: bool,
    }

    impl AsyncWrite for TrickleWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.interrupt_first {
                self.interrupt_first = false;
                return Poll::Ready(Err(io::ErrorKind::Interrupted.into()));
            }
            let n = buf.len().min(self.limit);
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn trickle(limit: usize) -> TrickleWriter {
        TrickleWriter {
            written: Vec::new(),
            limit,
            interrupt_first: true,
        }
    }

    #[tokio::test]
    async fn test_send_all_handles_short_and_interrupted_writes() {
        let mut writer = trickle(3);
        let outcome = send_all(&mut writer, b"hello\nworld\n", &Shutdown::new())
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Complete);
        assert_eq!(writer.written, b"hello\nworld\n");
    }

    #[tokio::test]
    async fn test_send_all_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut writer = trickle(3);
        let outcome = send_all(&mut writer, b"hello\n", &shutdown).await.unwrap();
        assert_eq!(outcome, SendOutcome::Cancelled);
        assert!(writer.written.is_empty());
    }

    #[tokio::test]
    async fn test_send_all_reports_write_zero() {
        let mut writer = trickle(0);
        writer.interrupt_first = false;
        let err = send_all(&mut writer, b"x\n", &Shutdown::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[tokio::test]
    async fn test_echo_after_commits_sends_whole_log() {
        let dir = tempfile::tempdir().unwrap();
        let journal = crate::journal::Journal::new(dir.path().join("data"), 0o600, false);
        let shutdown = Shutdown::new();

        let mut writer = trickle(4);
        let snapshot = journal.commit(b"hello\n").await.unwrap();
        echo(&mut writer, &snapshot, &shutdown).await.unwrap();
        let snapshot = journal.commit(b"world\n").await.unwrap();
        echo(&mut writer, &snapshot, &shutdown).await.unwrap();
        assert_eq!(writer.written, b"hello\nhello\nworld\n");
    }

    #[tokio::test]
    async fn test_echo_wraps_send_errors() {
        let mut writer = trickle(0);
        writer.interrupt_first = false;
        let result = echo(&mut writer, b"x\n", &Shutdown::new()).await;
        assert!(matches!(result, Err(ConnectionError::Send(_))));
    }
}
