//! In-memory store with optional JSON snapshots.
//!
//! Escrows and milestones live in DashMaps; conditional writes hold the
//! entry's shard lock for the check and the write. Payout rows live behind
//! one mutex so the "no other active row for this key" scan and the insert
//! are a single atomic step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::audit::types::{AuditEntry, AuditFilter};
use crate::escrow::types::{Escrow, EscrowStatus, Milestone, MilestoneStatus};
use crate::payments::types::{PayoutStatus, RetryableTransaction};
use crate::store::{
    AuditStore, EscrowStore, PayoutMutation, PayoutStore, StoreError, StoreResult,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    escrows: Vec<Escrow>,
    milestones: Vec<Milestone>,
    payouts: Vec<RetryableTransaction>,
    audit: Vec<AuditEntry>,
}

/// Built-in storage backend.
#[derive(Default)]
pub struct MemoryStore {
    escrows: DashMap<Uuid, Escrow>,
    milestones: DashMap<Uuid, Milestone>,
    payouts: Mutex<HashMap<Uuid, RetryableTransaction>>,
    audit: RwLock<Vec<AuditEntry>>,
    snapshot_path: Option<PathBuf>,
    snapshot_lock: tokio::sync::Mutex<()>,
}

impl MemoryStore {
    /// Volatile store; nothing survives a restart.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot-backed store, loading the file if it exists.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let store = Self {
            snapshot_path: Some(path.to_path_buf()),
            ..Self::default()
        };

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let snapshot: Snapshot = serde_json::from_reader(reader)?;

            for escrow in snapshot.escrows {
                store.escrows.insert(escrow.id, escrow);
            }
            for milestone in snapshot.milestones {
                store.milestones.insert(milestone.id, milestone);
            }
            {
                let mut payouts = store.payouts.lock().map_err(|_| StoreError::Poisoned)?;
                for row in snapshot.payouts {
                    payouts.insert(row.id, row);
                }
            }
            *store.audit.write().map_err(|_| StoreError::Poisoned)? = snapshot.audit;

            tracing::info!(
                path = %path.display(),
                escrows = store.escrows.len(),
                "Loaded store snapshot"
            );
        }

        Ok(store)
    }

    fn snapshot(&self) -> StoreResult<Snapshot> {
        let mut payouts: Vec<_> = self
            .payouts
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .values()
            .cloned()
            .collect();
        payouts.sort_by_key(|row| row.created_at);

        Ok(Snapshot {
            escrows: self.escrows.iter().map(|r| r.value().clone()).collect(),
            milestones: self.milestones.iter().map(|r| r.value().clone()).collect(),
            payouts,
            audit: self.audit.read().map_err(|_| StoreError::Poisoned)?.clone(),
        })
    }

    /// Write the snapshot file (no-op for a volatile store).
    ///
    /// Writes go to a temporary file first and are renamed into place.
    pub async fn save_snapshot(&self) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        // Build under the lock: a snapshot taken earlier must never land last.
        let _guard = self.snapshot_lock.lock().await;
        let bytes = serde_json::to_vec(&self.snapshot()?)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Snapshot after a mutation. The mutation already happened, so a
    /// failed write is logged rather than returned.
    async fn persist(&self) {
        if let Err(e) = self.save_snapshot().await {
            tracing::error!(error = %e, "Failed to write store snapshot");
        }
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn insert_escrow(&self, escrow: Escrow, milestones: Vec<Milestone>) -> StoreResult<()> {
        if self.escrows.contains_key(&escrow.id) {
            return Err(StoreError::Conflict(format!("escrow {} already exists", escrow.id)));
        }
        for milestone in milestones {
            self.milestones.insert(milestone.id, milestone);
        }
        self.escrows.insert(escrow.id, escrow);
        self.persist().await;
        Ok(())
    }

    async fn get_escrow(&self, id: Uuid) -> StoreResult<Escrow> {
        self.escrows
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("escrow {}", id)))
    }

    async fn list_escrows(&self, status: Option<EscrowStatus>) -> StoreResult<Vec<Escrow>> {
        let mut escrows: Vec<Escrow> = self
            .escrows
            .iter()
            .filter(|r| status.map_or(true, |s| r.value().status == s))
            .map(|r| r.value().clone())
            .collect();
        escrows.sort_by_key(|e| e.created_at);
        Ok(escrows)
    }

    async fn compare_and_set_escrow(&self, escrow: Escrow, expected: EscrowStatus) -> StoreResult<()> {
        {
            let mut current = self
                .escrows
                .get_mut(&escrow.id)
                .ok_or_else(|| StoreError::NotFound(format!("escrow {}", escrow.id)))?;
            if current.status != expected {
                return Err(StoreError::Conflict(format!(
                    "escrow {} is {}, expected {}",
                    escrow.id, current.status, expected
                )));
            }
            *current = escrow;
        }
        self.persist().await;
        Ok(())
    }

    async fn get_milestone(&self, id: Uuid) -> StoreResult<Milestone> {
        self.milestones
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("milestone {}", id)))
    }

    async fn list_milestones(&self, escrow_id: Uuid) -> StoreResult<Vec<Milestone>> {
        let mut milestones: Vec<Milestone> = self
            .milestones
            .iter()
            .filter(|r| r.value().escrow_id == escrow_id)
            .map(|r| r.value().clone())
            .collect();
        milestones.sort_by_key(|m| m.order_index);
        Ok(milestones)
    }

    async fn compare_and_set_milestone(
        &self,
        milestone: Milestone,
        expected: MilestoneStatus,
    ) -> StoreResult<()> {
        {
            let mut current = self
                .milestones
                .get_mut(&milestone.id)
                .ok_or_else(|| StoreError::NotFound(format!("milestone {}", milestone.id)))?;
            if current.status != expected {
                return Err(StoreError::Conflict(format!(
                    "milestone {} is {}, expected {}",
                    milestone.id,
                    current.status.as_str(),
                    expected.as_str()
                )));
            }
            *current = milestone;
        }
        self.persist().await;
        Ok(())
    }
}

#[async_trait]
impl PayoutStore for MemoryStore {
    async fn insert_payout_if_absent(&self, row: RetryableTransaction) -> StoreResult<()> {
        {
            let mut payouts = self.payouts.lock().map_err(|_| StoreError::Poisoned)?;
            let key = row.key();
            if let Some(active) = payouts
                .values()
                .find(|existing| existing.key() == key && existing.status.blocks_new_payout())
            {
                return Err(StoreError::Conflict(format!(
                    "{} payout for escrow {} is already {}",
                    active.kind,
                    key.escrow_id,
                    active.status.as_str()
                )));
            }
            payouts.insert(row.id, row);
        }
        self.persist().await;
        Ok(())
    }

    async fn get_payout(&self, id: Uuid) -> StoreResult<RetryableTransaction> {
        self.payouts
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("payout {}", id)))
    }

    async fn transition_payout(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        mutation: PayoutMutation,
    ) -> StoreResult<RetryableTransaction> {
        let updated = {
            let mut payouts = self.payouts.lock().map_err(|_| StoreError::Poisoned)?;
            let row = payouts
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("payout {}", id)))?;
            if row.status != expected {
                return Err(StoreError::Conflict(format!(
                    "payout {} is {}, expected {}",
                    id,
                    row.status.as_str(),
                    expected.as_str()
                )));
            }
            mutation(row);
            row.updated_at = Utc::now();
            row.clone()
        };
        self.persist().await;
        Ok(updated)
    }

    async fn list_payouts(&self, status: Option<PayoutStatus>) -> StoreResult<Vec<RetryableTransaction>> {
        let mut rows: Vec<_> = self
            .payouts
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .values()
            .filter(|row| status.map_or(true, |s| row.status == s))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn record_confirmations(&self, id: Uuid, confirmations: u64) -> StoreResult<()> {
        {
            let mut payouts = self.payouts.lock().map_err(|_| StoreError::Poisoned)?;
            let row = payouts
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("payout {}", id)))?;
            row.confirmations = Some(confirmations);
        }
        self.persist().await;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.audit
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .push(entry);
        Ok(())
    }

    async fn query_audit(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> = self
            .audit
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        // Stable sort over the reversed log: equal timestamps stay newest-first.
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let removed = {
            let mut audit = self.audit.write().map_err(|_| StoreError::Poisoned)?;
            let before = audit.len();
            audit.retain(|entry| entry.timestamp >= cutoff);
            before - audit.len()
        };
        if removed > 0 {
            self.persist().await;
        }
        Ok(removed)
    }
}
