//! Persistence seam.
//!
//! # Responsibilities
//! - Define the storage contracts the custody core depends on
//! - Make every status change a conditional write, so payout exclusivity
//!   holds across processes and not just across tasks
//!
//! # Design Decisions
//! - Traits are async so SQL/KV backends fit without blocking the runtime
//! - [`memory::MemoryStore`] implements all three traits with optional
//!   JSON snapshots; it is the built-in backend and the test backend

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::types::{AuditEntry, AuditFilter};
use crate::escrow::types::{Escrow, EscrowStatus, Milestone, MilestoneStatus};
use crate::payments::types::{PayoutStatus, RetryableTransaction};

pub use memory::MemoryStore;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write lost: the row is not in the expected state,
    /// or an active row already owns the key.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// In-place mutation applied by a successful payout compare-and-swap.
pub type PayoutMutation = Box<dyn FnOnce(&mut RetryableTransaction) + Send>;

/// Escrow and milestone records.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Insert a new escrow together with its milestones.
    async fn insert_escrow(&self, escrow: Escrow, milestones: Vec<Milestone>) -> StoreResult<()>;

    async fn get_escrow(&self, id: Uuid) -> StoreResult<Escrow>;

    async fn list_escrows(&self, status: Option<EscrowStatus>) -> StoreResult<Vec<Escrow>>;

    /// Replace the escrow iff its stored status still equals `expected`.
    async fn compare_and_set_escrow(&self, escrow: Escrow, expected: EscrowStatus) -> StoreResult<()>;

    async fn get_milestone(&self, id: Uuid) -> StoreResult<Milestone>;

    /// Milestones of one escrow ordered by `order_index`.
    async fn list_milestones(&self, escrow_id: Uuid) -> StoreResult<Vec<Milestone>>;

    /// Replace the milestone iff its stored status still equals `expected`.
    async fn compare_and_set_milestone(
        &self,
        milestone: Milestone,
        expected: MilestoneStatus,
    ) -> StoreResult<()>;
}

/// Retry rows for payouts.
#[async_trait]
pub trait PayoutStore: Send + Sync {
    /// Insert a new row unless a pending, processing or completed row
    /// exists for the same payout key.
    async fn insert_payout_if_absent(&self, row: RetryableTransaction) -> StoreResult<()>;

    async fn get_payout(&self, id: Uuid) -> StoreResult<RetryableTransaction>;

    /// Apply `mutation` iff the row's status equals `expected`; returns the updated row.
    async fn transition_payout(
        &self,
        id: Uuid,
        expected: PayoutStatus,
        mutation: PayoutMutation,
    ) -> StoreResult<RetryableTransaction>;

    /// Rows in `status` (all rows for `None`), oldest first.
    async fn list_payouts(&self, status: Option<PayoutStatus>) -> StoreResult<Vec<RetryableTransaction>>;

    async fn record_confirmations(&self, id: Uuid, confirmations: u64) -> StoreResult<()>;
}

/// Append-only audit storage.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, entry: AuditEntry) -> StoreResult<()>;

    /// Matching entries, newest first, truncated to `filter.limit`.
    async fn query_audit(&self, filter: &AuditFilter) -> StoreResult<Vec<AuditEntry>>;

    /// Retention only: delete entries older than `cutoff`.
    async fn delete_audit_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}
