//! Escrow API handlers.
//!
//! Payout-triggering handlers run the engine call in its own task: a client
//! that disconnects or hits the request timeout cannot abandon a payout
//! halfway through its retries.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::future::Future;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditFilter};
use crate::error::{EscrowError, EscrowResult};
use crate::escrow::{
    BalanceReport, EscrowDetails, EscrowStatus, EscrowView, Milestone, MilestoneRelease, NewEscrow,
};
use crate::health::{HealthReport, HealthStatus};
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::security::{ActorContext, OperationClass};

const DEFAULT_AUDIT_LIMIT: usize = 100;
const MAX_AUDIT_LIMIT: usize = 1_000;

#[derive(Debug, Deserialize)]
pub struct FundRequest {
    pub tx_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct DisputeRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

async fn detached<T, F>(fut: F) -> Result<T, ApiError>
where
    F: Future<Output = EscrowResult<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => Err(ApiError(EscrowError::Storage(format!("operation task failed: {}", e)))),
    }
}

pub async fn create_escrow(
    State(state): State<AppState>,
    ctx: ActorContext,
    Json(input): Json<NewEscrow>,
) -> Result<(StatusCode, Json<EscrowView>), ApiError> {
    let view = state.engine.create(input, &ctx).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EscrowDetails>, ApiError> {
    Ok(Json(state.engine.get(id).await?))
}

pub async fn fund_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ctx: ActorContext,
    Json(body): Json<FundRequest>,
) -> Result<Json<EscrowView>, ApiError> {
    Ok(Json(state.engine.mark_funded(id, &body.tx_hash, &ctx).await?))
}

pub async fn release_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ctx: ActorContext,
) -> Result<Json<EscrowView>, ApiError> {
    state
        .limiter
        .enforce(&ctx.rate_limit_key(), OperationClass::ReleaseFunds)?;
    let engine = state.engine.clone();
    let view = detached(async move { engine.release(id, &ctx).await }).await?;
    Ok(Json(view))
}

pub async fn cancel_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ctx: ActorContext,
) -> Result<Json<EscrowView>, ApiError> {
    if state.engine.find(id).await?.status == EscrowStatus::Funded {
        state
            .limiter
            .enforce(&ctx.rate_limit_key(), OperationClass::RefundFunds)?;
    }
    let engine = state.engine.clone();
    let view = detached(async move { engine.cancel(id, &ctx).await }).await?;
    Ok(Json(view))
}

pub async fn open_dispute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ctx: ActorContext,
    Json(body): Json<DisputeRequest>,
) -> Result<Json<EscrowView>, ApiError> {
    Ok(Json(state.engine.open_dispute(id, &body.reason, &ctx).await?))
}

pub async fn complete_milestone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ctx: ActorContext,
) -> Result<Json<Milestone>, ApiError> {
    Ok(Json(state.engine.complete_milestone(id, &ctx).await?))
}

pub async fn release_milestone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ctx: ActorContext,
) -> Result<Json<MilestoneRelease>, ApiError> {
    state
        .limiter
        .enforce(&ctx.rate_limit_key(), OperationClass::ReleaseFunds)?;
    let engine = state.engine.clone();
    let released = detached(async move { engine.release_milestone(id, &ctx).await }).await?;
    Ok(Json(released))
}

pub async fn check_balance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ctx: ActorContext,
) -> Result<Json<BalanceReport>, ApiError> {
    state
        .limiter
        .enforce(&ctx.rate_limit_key(), OperationClass::CheckBalance)?;
    Ok(Json(state.engine.check_balance(id, &ctx).await?))
}

pub async fn escrow_audit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    // 404 for unknown escrows rather than an empty list.
    state.engine.find(id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).min(MAX_AUDIT_LIMIT);
    let entries = state
        .audit
        .query(&AuditFilter::for_escrow(id).limit(limit))
        .await
        .map_err(EscrowError::from)?;
    Ok(Json(entries))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.check().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(report))
}
