//! Shutdown coordination.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Broadcast coordinator every long-running task subscribes to.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Sender handle for components that subscribe on their own.
    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.tx
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Tasks still holding a receiver.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait for background tasks to stop, abandoning any still running at the deadline.
    pub async fn drain(handles: Vec<JoinHandle<()>>, deadline: Duration) {
        let count = handles.len();
        let joined = tokio::time::timeout(deadline, futures_util::future::join_all(handles)).await;
        match joined {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    tracing::error!(panicked, "Background tasks panicked during shutdown");
                }
                tracing::info!(tasks = count, "Background tasks stopped");
            }
            Err(_) => {
                tracing::warn!(tasks = count, deadline_secs = deadline.as_secs(), "Shutdown deadline reached; abandoning tasks");
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
