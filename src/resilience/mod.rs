//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Payout broadcast (payments::dispatcher):
//!     → blockchain client enforces the broadcast timeout
//!     → On transient failure: backoff.rs computes the next delay
//!
//! Webhook delivery (webhooks::notifier):
//!     → timeouts.rs bounds each POST
//!     → backoff.rs spaces redeliveries
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Only transient failures are retried
//! - One backoff formula for payouts and webhooks

pub mod backoff;
pub mod timeouts;

pub use backoff::{calculate_backoff, RetryPolicy};
pub use timeouts::{with_timeout, Elapsed};
