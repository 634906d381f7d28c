//! Process-wide shutdown flag.
//!
//! The flag is set at most once, by the first SIGINT or SIGTERM, and is
//! never cleared. Every suspension point in the accept loop and the
//! connection handlers selects on `Shutdown::wait` so a blocked accept,
//! receive or send unwinds as soon as the flag is raised.

use std::io;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cloneable handle to the shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the flag. Returns `true` only for the call that actually set it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        })
    }

    /// Whether the flag has been raised.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the flag is raised. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|&flag| flag).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Install SIGINT/SIGTERM handlers that raise `shutdown`.
///
/// Handlers are registered before this returns, so registration failure is
/// reported to the caller. Must be called from within a Tokio runtime.
pub fn listen_for_signals(shutdown: Shutdown) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            };
            if shutdown.trigger() {
                info!(signal = name, "Caught signal, exiting");
            } else {
                debug!(signal = name, "Shutdown already in progress");
            }
        }
    }))
}
