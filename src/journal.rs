//! Durable, append-only packet log.
//!
//! One file holds the concatenation of every committed packet, in commit
//! order, across all connections. The file is emptied by the first append
//! of a run and unlinked at shutdown.
//!
//! ## Commit
//!
//! `commit` appends a packet and reads the whole file back while holding a
//! single lock, so the returned snapshot always ends with that packet and
//! is a prefix of every later snapshot. The lock covers file I/O only;
//! callers send the snapshot after it is released.

use crate::config::Config;
use crate::error::ConnectionError;
use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Mutable state guarded by the commit lock.
#[derive(Debug, Default)]
struct JournalState {
    /// Whether this run has written to the file yet.
    started: bool,
    /// Bytes committed during this run.
    len: u64,
}

/// Shared packet log backed by a single file.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    mode: u32,
    fsync: bool,
    state: Mutex<JournalState>,
}

impl Journal {
    /// Create a journal for `path`. Nothing is touched on disk until the first append.
    pub fn new(path: impl Into<PathBuf>, mode: u32, fsync: bool) -> Self {
        Self {
            path: path.into(),
            mode,
            fsync,
            state: Mutex::new(JournalState::default()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.data_file, config.file_mode, config.fsync)
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one packet, then snapshot the full log, as one critical section.
    pub async fn commit(&self, packet: &[u8]) -> Result<Bytes, ConnectionError> {
        let mut state = self.state.lock().await;
        self.append_locked(&mut state, packet)
            .await
            .map_err(ConnectionError::Append)?;
        self.read_locked(&state)
            .await
            .map_err(ConnectionError::ReadBack)
    }

    /// Append bytes to the end of the log.
    ///
    /// The write is flushed (and synced, if configured) before returning.
    pub async fn append(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock().await;
        self.append_locked(&mut state, data).await
    }

    /// Read every byte committed so far.
    pub async fn read_all(&self) -> io::Result<Bytes> {
        let state = self.state.lock().await;
        self.read_locked(&state).await
    }

    /// Unlink the backing file. A file that was never created is not an error.
    pub async fn remove(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed data file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Data file already absent");
            }
            Err(e) => return Err(e),
        }
        *state = JournalState::default();
        Ok(())
    }

    async fn append_locked(&self, state: &mut JournalState, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(self.mode)
            .open(&self.path)
            .await?;

        if !state.started {
            // First append of the run empties anything left by a previous one.
            file.set_len(0).await?;
            state.started = true;
            state.len = 0;
        } else {
            let on_disk = file.metadata().await?.len();
            if on_disk > state.len {
                warn!(
                    committed = state.len,
                    on_disk, "Dropping uncommitted bytes from data file"
                );
                file.set_len(state.len).await?;
            }
        }
        file.seek(SeekFrom::End(0)).await?;

        if let Err(e) = self.write_durable(&mut file, data).await {
            // Bytes of a failed append must never be read back.
            if let Err(rollback) = file.set_len(state.len).await {
                warn!(error = %rollback, "Failed to roll back partial append");
            }
            return Err(e);
        }
        state.len += data.len() as u64;

        trace!(bytes = data.len(), total = state.len, "Appended to data file");
        Ok(())
    }

    async fn write_durable(&self, file: &mut File, data: &[u8]) -> io::Result<()> {
        file.write_all(data).await?;
        file.flush().await?;
        if self.fsync {
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn read_locked(&self, state: &JournalState) -> io::Result<Bytes> {
        if !state.started {
            return Ok(Bytes::new());
        }
        let mut contents = tokio::fs::read(&self.path).await?;
        contents.truncate(usize::try_from(state.len).unwrap_or(usize::MAX));
        Ok(Bytes::from(contents))
    }
}
