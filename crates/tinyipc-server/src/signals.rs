//! Stop signals for the dispatch loop.
//!
//! A server stops when its [`ShutdownHandle`] is triggered, either by code
//! holding the handle or by the listener spawned from
//! [`SignalHandler::spawn_listener`] on SIGTERM/SIGINT.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::ServerResult;

/// Owns the stop channel and optionally listens for OS signals.
#[derive(Debug)]
pub struct SignalHandler {
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHandler {
    /// Creates a new signal handler.
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Spawns a task triggering shutdown on SIGTERM or SIGINT.
    #[cfg(unix)]
    pub fn spawn_listener(&self) -> ServerResult<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let shutdown_tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
                _ = sigint.recv() => info!("Received SIGINT, stopping"),
            }
            shutdown_tx.send_replace(true);
            debug!("Signal listener stopped");
        });
        Ok(())
    }

    /// Spawns a task triggering shutdown on Ctrl+C.
    #[cfg(not(unix))]
    pub fn spawn_listener(&self) -> ServerResult<()> {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C, stopping");
                shutdown_tx.send_replace(true);
            }
        });
        Ok(())
    }

    /// Returns true if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Creates a handle that can be passed to other components.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
            rx: self.shutdown_rx.clone(),
        }
    }
}

/// A future-producing view of the stop flag.
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Waits until shutdown is triggered.
    pub async fn wait(mut self) {
        // The handler keeps a sender alive, so this only errors on teardown
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// A handle for triggering or checking shutdown.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Asks the server to stop. Calling this more than once has no effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Returns a signal whose `wait` completes when shutdown is triggered.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.rx.clone(),
        }
    }
}
