use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admin::AdminState;
use crate::audit::{export, AuditFilter, AuditStatistics};
use crate::error::EscrowError;
use crate::escrow::{run_recovery_once, RecoveryReport};
use crate::health::HealthReport;
use crate::http::ApiError;
use crate::payments::{PayoutStatus, RetryableTransaction};

/// Entries included in the text report's recent-activity section.
const REPORT_RECENT_ENTRIES: usize = 20;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub health: HealthReport,
    pub pending_payouts: usize,
    pub processing_payouts: usize,
    pub failed_payouts: usize,
}

#[derive(Debug, Deserialize)]
pub struct PayoutQuery {
    pub status: Option<PayoutStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FailRequest {
    pub reason: Option<String>,
}

pub async fn get_status(State(state): State<AdminState>) -> Result<Json<SystemStatus>, ApiError> {
    let health = state.health.check().await;
    let payouts = state.engine.dispatcher().payouts().list_payouts(None).await.map_err(EscrowError::from)?;
    let count = |status: PayoutStatus| payouts.iter().filter(|p| p.status == status).count();

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        health,
        pending_payouts: count(PayoutStatus::Pending),
        processing_payouts: count(PayoutStatus::Processing),
        failed_payouts: count(PayoutStatus::Failed),
    }))
}

pub async fn audit_stats(
    State(state): State<AdminState>,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<AuditStatistics>, ApiError> {
    let stats = state.audit.statistics(&filter).await.map_err(EscrowError::from)?;
    Ok(Json(stats))
}

pub async fn audit_csv(
    State(state): State<AdminState>,
    Query(filter): Query<AuditFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state.audit.query(&filter).await.map_err(EscrowError::from)?;
    Ok(([(CONTENT_TYPE, "text/csv; charset=utf-8")], export::to_csv(&entries)))
}

pub async fn audit_report(
    State(state): State<AdminState>,
    Query(filter): Query<AuditFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.audit.statistics(&filter).await.map_err(EscrowError::from)?;
    let recent = AuditFilter {
        limit: Some(filter.limit.unwrap_or(REPORT_RECENT_ENTRIES)),
        ..filter
    };
    let entries = state.audit.query(&recent).await.map_err(EscrowError::from)?;
    Ok((
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        export::to_text_report(&stats, &entries),
    ))
}

pub async fn list_payouts(
    State(state): State<AdminState>,
    Query(query): Query<PayoutQuery>,
) -> Result<Json<Vec<RetryableTransaction>>, ApiError> {
    let rows = state
        .engine
        .dispatcher()
        .payouts()
        .list_payouts(query.status)
        .await
        .map_err(EscrowError::from)?;
    Ok(Json(rows))
}

pub async fn recover_payouts(State(state): State<AdminState>) -> Result<Json<RecoveryReport>, ApiError> {
    let report = run_recovery_once(&state.engine, state.processing_timeout).await?;
    Ok(Json(report))
}

pub async fn fail_payout(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<RetryableTransaction>, ApiError> {
    let request: FailRequest = if body.is_empty() {
        FailRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| EscrowError::validation(format!("invalid request body: {}", e)))?
    };
    let reason = request.reason.unwrap_or_else(|| "no reason given".to_string());
    let row = state.engine.dispatcher().mark_failed(id, &reason).await?;
    Ok(Json(row))
}
