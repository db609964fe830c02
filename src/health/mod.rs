//! Health reporting.
//!
//! # States
//! ```text
//! healthy:   vault self-test passes, RPC reachable
//! degraded:  vault self-test passes, RPC unreachable (reads work, payouts fail)
//! unhealthy: vault self-test fails (no key can be decrypted)
//! ```

pub mod monitor;

use serde::Serialize;

pub use monitor::HealthMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub vault_self_test: bool,
    pub rpc_reachable: bool,
    pub audit_queue_depth: usize,
    pub version: &'static str,
}

impl HealthReport {
    pub fn new(vault_self_test: bool, rpc_reachable: bool, audit_queue_depth: usize) -> Self {
        let status = if !vault_self_test {
            HealthStatus::Unhealthy
        } else if !rpc_reachable {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            vault_self_test,
            rpc_reachable,
            audit_queue_depth,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
