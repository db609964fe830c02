//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define custody metrics (transitions, payouts, audit, limits, RPC health)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `escrow_transitions_total` (counter): status changes by target status
//! - `payout_attempts_total` (counter): broadcast attempts by kind, outcome
//! - `payout_duration_seconds` (histogram): submit-to-settle latency by kind
//! - `audit_entries_total` (counter): enqueued entries by action
//! - `audit_write_failures_total` (counter): entries that never reached storage
//! - `rate_limited_total` (counter): rejected calls by operation class
//! - `rpc_health` (gauge): 1=reachable, 0=unreachable
//! - `webhook_deliveries_total` (counter): deliveries by outcome
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests need no setup
//! - Label values are fixed vocabularies; no ids in labels

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_transition(to: &'static str) {
    ::metrics::counter!("escrow_transitions_total", "to" => to).increment(1);
}

pub fn record_payout_attempt(kind: &'static str, outcome: &'static str) {
    ::metrics::counter!("payout_attempts_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn record_payout_duration(kind: &'static str, started: Instant) {
    ::metrics::histogram!("payout_duration_seconds", "kind" => kind)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_audit_entry(action: &'static str) {
    ::metrics::counter!("audit_entries_total", "action" => action).increment(1);
}

pub fn record_audit_write_failure() {
    ::metrics::counter!("audit_write_failures_total").increment(1);
}

pub fn record_rate_limited(operation: &'static str) {
    ::metrics::counter!("rate_limited_total", "operation" => operation).increment(1);
}

pub fn record_rpc_health(healthy: bool) {
    ::metrics::gauge!("rpc_health").set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_webhook_delivery(outcome: &'static str) {
    ::metrics::counter!("webhook_deliveries_total", "outcome" => outcome).increment(1);
}
