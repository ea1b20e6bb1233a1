//! Graceful shutdown for the relay binaries.
//!
//! [`ShutdownSignal::listen`] turns SIGINT/SIGTERM into a broadcast that every
//! clone of the signal observes, so the server can stop accepting requests
//! and the worker can finish its current batch before acknowledging and
//! exiting.

use tokio::sync::broadcast;
use tracing::{info, warn};

/// Broadcast handle for shutdown notification.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Wait for SIGINT or SIGTERM, then notify every subscriber.
    pub async fn listen(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
        }

        let _ = self.sender.send(());
    }

    /// Trigger shutdown without an OS signal.
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        let _ = self.sender.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
