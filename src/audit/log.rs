//! Audit outbox.
//!
//! # Responsibilities
//! - Accept entries without ever failing or blocking the caller
//! - Drain entries into the [`AuditStore`] from a single worker task
//! - Report write failures on the `audit_ops` tracing target
//! - Serve newest-first queries and the statistics projection
//! - Purge entries past the retention horizon
//!
//! # Design Decisions
//! - Money movement is never held up by audit storage: `append` only
//!   enqueues, and a failed write is reported, not returned
//! - Entries are written in enqueue order; `flush` waits for everything
//!   queued before it

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::audit::types::{AuditEntry, AuditFilter, AuditStatistics};
use crate::observability::metrics;
use crate::store::{AuditStore, StoreResult};

/// Tracing target for audit write failures.
pub const AUDIT_OPS_TARGET: &str = "audit_ops";

enum Command {
    Append(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the audit outbox.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<Command>,
    store: Arc<dyn AuditStore>,
    depth: Arc<AtomicUsize>,
}

impl AuditLog {
    /// Create the outbox and spawn its worker.
    ///
    /// The worker exits once every handle has been dropped and the queue is drained.
    pub fn start(store: Arc<dyn AuditStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(rx, store.clone(), depth.clone()));
        (Self { tx, store, depth }, worker)
    }

    /// Enqueue an entry. Never fails and never waits.
    pub fn append(&self, entry: AuditEntry) {
        metrics::record_audit_entry(entry.action.name());
        self.depth.fetch_add(1, Ordering::SeqCst);

        match self.tx.try_send(Command::Append(entry)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                // Queue is saturated: hand the entry to a task instead of waiting here.
                let tx = self.tx.clone();
                let depth = self.depth.clone();
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(Command::Append(entry))) = tx.send(command).await {
                        depth.fetch_sub(1, Ordering::SeqCst);
                        report_failure(&entry, "audit outbox closed");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(Command::Append(entry))) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                report_failure(&entry, "audit outbox closed");
            }
            Err(mpsc::error::TrySendError::Closed(Command::Flush(_))) => {}
        }
    }

    /// Wait until every entry enqueued before this call has been written (or reported).
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Entries still waiting to be written.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Matching entries, newest first.
    pub async fn query(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditEntry>> {
        self.store.query_audit(filter).await
    }

    /// Aggregate statistics, recomputed from the log on every call.
    pub async fn statistics(&self, filter: &AuditFilter) -> StoreResult<AuditStatistics> {
        let unbounded = AuditFilter {
            limit: None,
            ..filter.clone()
        };
        let entries = self.store.query_audit(&unbounded).await?;
        Ok(AuditStatistics::from_entries(&entries))
    }

    /// Delete entries older than `retention_days`. Zero keeps everything.
    pub async fn purge_expired(&self, retention_days: u32) -> StoreResult<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let removed = self.store.delete_audit_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "Purged expired audit entries");
        }
        Ok(removed)
    }

    /// Run the retention job until shutdown.
    pub fn spawn_retention(
        &self,
        retention_days: u32,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            if retention_days == 0 {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = log.purge_expired(retention_days).await {
                            tracing::error!(target: AUDIT_OPS_TARGET, error = %e, "Audit retention failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

fn report_failure(entry: &AuditEntry, error: &str) {
    metrics::record_audit_write_failure();
    tracing::error!(
        target: AUDIT_OPS_TARGET,
        escrow_id = %entry.escrow_id,
        action = entry.action.name(),
        entry_id = %entry.id,
        error = error,
        "Audit write failed"
    );
}

async fn run_worker(
    mut rx: mpsc::Receiver<Command>,
    store: Arc<dyn AuditStore>,
    depth: Arc<AtomicUsize>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Append(entry) => {
                if let Err(e) = store.append_audit(entry.clone()).await {
                    report_failure(&entry, &e.to_string());
                }
                depth.fetch_sub(1, Ordering::SeqCst);
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Audit worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::types::AuditAction;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use chrono::DateTime;
    use uuid::Uuid;

    struct BrokenStore;

    #[async_trait]
    impl AuditStore for BrokenStore {
        async fn append_audit(&self, _entry: AuditEntry) -> StoreResult<()> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        async fn query_audit(&self, _filter: &AuditFilter) -> StoreResult<Vec<AuditEntry>> {
            Ok(Vec::new())
        }

        async fn delete_audit_before(&self, _cutoff: DateTime<Utc>) -> StoreResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let (log, _worker) = AuditLog::start(Arc::new(MemoryStore::new()), 16);
        let escrow_id = Uuid::new_v4();

        log.append(AuditEntry::new(escrow_id, AuditAction::WalletCreated, "system"));
        log.append(AuditEntry::new(escrow_id, AuditAction::EscrowFunded, "buyer"));
        log.flush().await;

        let entries = log.query(&AuditFilter::for_escrow(escrow_id)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.depth(), 0);

        let limited = log
            .query(&AuditFilter::for_escrow(escrow_id).limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_does_not_propagate() {
        let (log, _worker) = AuditLog::start(Arc::new(BrokenStore), 16);
        log.append(AuditEntry::new(Uuid::new_v4(), AuditAction::WalletCreated, "system"));
        log.flush().await;
        assert_eq!(log.depth(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block() {
        let (log, _worker) = AuditLog::start(Arc::new(MemoryStore::new()), 1);
        let escrow_id = Uuid::new_v4();
        for _ in 0..50 {
            log.append(AuditEntry::new(escrow_id, AuditAction::EscrowFunded, "buyer"));
        }

        // Overflow entries are handed to tasks; give them a moment to land.
        for _ in 0..100 {
            log.flush().await;
            if log.depth() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let entries = log.query(&AuditFilter::for_escrow(escrow_id)).await.unwrap();
        assert_eq!(entries.len(), 50);
    }

    #[tokio::test]
    async fn test_statistics_ignore_limit() {
        let (log, _worker) = AuditLog::start(Arc::new(MemoryStore::new()), 16);
        let escrow_id = Uuid::new_v4();
        for _ in 0..3 {
            log.append(AuditEntry::new(escrow_id, AuditAction::WalletCreated, "system"));
        }
        log.flush().await;

        let stats = log
            .statistics(&AuditFilter::for_escrow(escrow_id).limit(1))
            .await
            .unwrap();
        assert_eq!(stats.wallet_creations, 3);
    }

    #[tokio::test]
    async fn test_retention_zero_keeps_everything() {
        let (log, _worker) = AuditLog::start(Arc::new(MemoryStore::new()), 16);
        let old = Utc::now() - ChronoDuration::days(400);
        log.append(AuditEntry::new(Uuid::new_v4(), AuditAction::WalletCreated, "system").at(old));
        log.flush().await;

        assert_eq!(log.purge_expired(0).await.unwrap(), 0);
        assert_eq!(log.purge_expired(30).await.unwrap(), 1);
    }
}
