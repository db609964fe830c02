//! Append-only audit trail.
//!
//! # Data Flow
//! ```text
//! engine / dispatcher
//!     → AuditLog::append (enqueue, never fails)
//!     → worker task → AuditStore::append_audit
//!     → on failure: tracing target "audit_ops" + audit_write_failures_total
//!
//! read side:
//!     AuditLog::query / statistics → export.rs (CSV, text report)
//! ```

pub mod export;
pub mod log;
pub mod types;

pub use log::{AuditLog, AUDIT_OPS_TARGET};
pub use types::{AuditAction, AuditEntry, AuditFilter, AuditStatistics, PayoutOutcome, RequestOrigin};
