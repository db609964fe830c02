//! Custody health checks.
//!
//! # Responsibilities
//! - Run the vault self-test (wrong or missing secret shows up here first)
//! - Check RPC reachability
//! - Report the audit outbox depth
//! - Periodically log transitions between states

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;

use crate::audit::AuditLog;
use crate::blockchain::client::ChainRpc;
use crate::custody::KeyVault;
use crate::health::{HealthReport, HealthStatus};
use crate::observability::metrics;
use crate::resilience::with_timeout;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthMonitor {
    vault: Arc<KeyVault>,
    rpc: Arc<dyn ChainRpc>,
    audit: AuditLog,
    last: ArcSwap<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(vault: Arc<KeyVault>, rpc: Arc<dyn ChainRpc>, audit: AuditLog) -> Self {
        Self {
            vault,
            rpc,
            audit,
            last: ArcSwap::from_pointee(None),
        }
    }

    /// Run every check now.
    pub async fn check(&self) -> HealthReport {
        let vault_ok = match self.vault.self_test() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Key vault self-test failed");
                false
            }
        };
        let rpc_ok = with_timeout(CHECK_TIMEOUT, self.rpc.is_healthy())
            .await
            .unwrap_or(false);
        metrics::record_rpc_health(rpc_ok);

        let report = HealthReport::new(vault_ok, rpc_ok, self.audit.depth());
        self.last.store(Arc::new(Some(report.clone())));
        report
    }

    /// Most recent report from `check` or the periodic loop.
    pub fn last_report(&self) -> Option<HealthReport> {
        (**self.last.load()).clone()
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = interval.as_secs(), "Health monitor starting");
        let mut ticker = time::interval(interval);
        let mut previous: Option<HealthStatus> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.check().await;
                    if previous != Some(report.status) {
                        match report.status {
                            HealthStatus::Healthy => tracing::info!(status = report.status.as_str(), "Service health changed"),
                            _ => tracing::warn!(
                                status = report.status.as_str(),
                                vault = report.vault_self_test,
                                rpc = report.rpc_reachable,
                                "Service health changed"
                            ),
                        }
                        previous = Some(report.status);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
