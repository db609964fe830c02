//! Operator API.
//!
//! Served on its own bind address so it can stay off the public network.
//! Every route requires `Authorization: Bearer <admin.api_key>`.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLog;
use crate::escrow::EscrowEngine;
use crate::health::HealthMonitor;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<EscrowEngine>,
    pub audit: AuditLog,
    pub health: Arc<HealthMonitor>,
    pub api_key: Arc<String>,
    /// Age after which a payout row counts as abandoned during recovery.
    pub processing_timeout: Duration,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/audit/stats", get(audit_stats))
        .route("/admin/audit/export.csv", get(audit_csv))
        .route("/admin/audit/report", get(audit_report))
        .route("/admin/payouts", get(list_payouts))
        .route("/admin/payouts/recover", post(recover_payouts))
        .route("/admin/payouts/{id}/fail", post(fail_payout))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
