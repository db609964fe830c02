//! Background sweeps.
//!
//! # Responsibilities
//! - Auto-release time-locked escrows once their date has passed
//! - Detect funding from the custody balance and expire stale pending escrows
//! - Recover payouts interrupted by a crash or restart
//!
//! # Design Decisions
//! - Each sweep is a `_once` function plus a loop, so tests and the admin
//!   API drive sweeps directly without timers
//! - Resumed payouts run as independent tasks; one slow payout never
//!   holds up another escrow

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::SweepConfig;
use crate::error::EscrowResult;
use crate::escrow::engine::EscrowEngine;
use crate::payments::PayoutStatus;

const MAX_TIMEOUT_DAYS: i64 = 3_650;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub reset_stuck: usize,
    pub resumed: usize,
    pub resume_failed: usize,
    pub exhausted: usize,
    pub finalized: usize,
}

/// One recovery pass.
///
/// Rows untouched for longer than `processing_timeout` are considered
/// abandoned; rows updated more recently still belong to a live caller.
pub async fn run_recovery_once(
    engine: &Arc<EscrowEngine>,
    processing_timeout: Duration,
) -> EscrowResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let dispatcher = engine.dispatcher().clone();
    let timeout = ChronoDuration::from_std(processing_timeout)
        .unwrap_or_else(|_| ChronoDuration::days(MAX_TIMEOUT_DAYS))
        .min(ChronoDuration::days(MAX_TIMEOUT_DAYS));
    let cutoff = Utc::now() - timeout;

    report.reset_stuck = dispatcher.reset_stuck(cutoff).await?;

    let mut tasks = JoinSet::new();
    for row in dispatcher.payouts().list_payouts(Some(PayoutStatus::Pending)).await? {
        if row.updated_at >= cutoff {
            continue;
        }
        if !row.attempts_left() {
            match dispatcher.mark_failed(row.id, "retry budget exhausted").await {
                Ok(_) => report.exhausted += 1,
                Err(e) => tracing::warn!(payout_id = %row.id, error = %e, "Failed to close exhausted payout"),
            }
            continue;
        }

        let engine = engine.clone();
        tasks.spawn(async move {
            let resumed = engine.dispatcher().resume(row.id).await;
            if resumed.is_ok() {
                if let Ok(done) = engine.dispatcher().payouts().get_payout(row.id).await {
                    if let Err(e) = engine.finalize_payout(&done).await {
                        tracing::error!(payout_id = %row.id, escrow_id = %row.escrow_id, error = %e, "Failed to finalize resumed payout");
                    }
                }
            }
            (row.id, resumed.map(|_| ()))
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => report.resumed += 1,
            Ok((payout_id, Err(e))) => {
                tracing::warn!(payout_id = %payout_id, error = %e, "Resumed payout did not complete");
                report.resume_failed += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "Payout recovery task panicked");
                report.resume_failed += 1;
            }
        }
    }

    for row in dispatcher.payouts().list_payouts(Some(PayoutStatus::Completed)).await? {
        match engine.finalize_payout(&row).await {
            Ok(true) => report.finalized += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::error!(payout_id = %row.id, escrow_id = %row.escrow_id, error = %e, "Failed to finalize completed payout")
            }
        }
    }

    if report != RecoveryReport::default() {
        tracing::info!(?report, "Payout recovery pass finished");
    }
    Ok(report)
}

/// Background sweep tasks.
pub struct Sweeper {
    engine: Arc<EscrowEngine>,
    config: SweepConfig,
    processing_timeout: Duration,
}

impl Sweeper {
    pub fn new(engine: Arc<EscrowEngine>, config: SweepConfig, processing_timeout: Duration) -> Self {
        Self {
            engine,
            config,
            processing_timeout,
        }
    }

    /// Spawn every sweep loop; each stops on the shutdown signal.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let engine = self.engine.clone();
        handles.push(spawn_loop(
            "auto_release",
            self.config.auto_release_interval_secs,
            shutdown.subscribe(),
            move || {
                let engine = engine.clone();
                async move { engine.auto_release(Utc::now()).await.map(|_| ()) }
            },
        ));

        let engine = self.engine.clone();
        handles.push(spawn_loop(
            "funding",
            self.config.funding_check_interval_secs,
            shutdown.subscribe(),
            move || {
                let engine = engine.clone();
                async move {
                    engine.detect_funding().await?;
                    engine.expire(Utc::now()).await.map(|_| ())
                }
            },
        ));

        let engine = self.engine.clone();
        let timeout = self.processing_timeout;
        handles.push(spawn_loop(
            "payout_recovery",
            self.config.recovery_interval_secs,
            shutdown.subscribe(),
            move || {
                let engine = engine.clone();
                async move { run_recovery_once(&engine, timeout).await.map(|_| ()) }
            },
        ));

        handles
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval_secs: u64,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = EscrowResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if interval_secs == 0 {
            tracing::info!(sweep = name, "Sweep disabled");
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = tick().await {
                        tracing::error!(sweep = name, error = %e, "Sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!(sweep = name, "Sweep stopped");
                    break;
                }
            }
        }
    })
}
