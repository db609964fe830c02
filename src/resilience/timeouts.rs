//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap outbound calls (webhooks, sweeps) with a deadline
//! - Keep timeout errors distinct from other failures

use std::future::Future;
use std::time::Duration;

/// Returned when the deadline passes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {0:?}")]
pub struct Elapsed(pub Duration);

/// Run `fut` with a deadline.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T, Elapsed>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Elapsed(duration))
}
