//! Caller identity for escrow operations.
//!
//! The acting wallet address arrives in the `X-Actor-Address` header.
//! Role checks (buyer, seller, system) happen in the lifecycle engine; this
//! module only establishes who is asking and from where.

use alloy::primitives::Address;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;

use crate::audit::RequestOrigin;
use crate::escrow::types::Actor;

pub const X_ACTOR_ADDRESS: &str = "x-actor-address";

/// Who is calling, plus request metadata for the audit trail.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor: Actor,
    pub origin: RequestOrigin,
}

impl ActorContext {
    pub fn user(address: Address) -> Self {
        Self {
            actor: Actor::User(address),
            origin: RequestOrigin::default(),
        }
    }

    /// Background sweeps.
    pub fn system() -> Self {
        Self {
            actor: Actor::System,
            origin: RequestOrigin::default(),
        }
    }

    /// Key used by the rate limiter: the actor address, else the client IP.
    pub fn rate_limit_key(&self) -> String {
        match self.actor {
            Actor::User(address) => address.to_string(),
            Actor::System => self
                .origin
                .ip_address
                .clone()
                .unwrap_or_else(|| "system".to_string()),
        }
    }
}

/// Rejection for requests without a usable actor header.
#[derive(Debug)]
pub enum ActorRejection {
    Missing,
    Invalid(String),
}

impl IntoResponse for ActorRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Missing => (
                StatusCode::UNAUTHORIZED,
                "missing X-Actor-Address header".to_string(),
            ),
            Self::Invalid(value) => (
                StatusCode::BAD_REQUEST,
                format!("invalid X-Actor-Address '{}'", value),
            ),
        };
        let body = serde_json::json!({
            "error": message,
            "code": "invalid_actor",
        });
        (status, Json(body)).into_response()
    }
}

fn request_origin(parts: &Parts) -> RequestOrigin {
    let forwarded = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let user_agent = parts
        .headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    RequestOrigin {
        ip_address: forwarded.or(peer),
        user_agent,
    }
}

impl<S> FromRequestParts<S> for ActorContext
where
    S: Send + Sync,
{
    type Rejection = ActorRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(X_ACTOR_ADDRESS)
            .ok_or(ActorRejection::Missing)?
            .to_str()
            .map_err(|_| ActorRejection::Invalid("<non-ascii>".to_string()))?
            .trim()
            .to_string();

        let address: Address = raw
            .parse()
            .map_err(|_| ActorRejection::Invalid(raw.clone()))?;

        Ok(Self {
            actor: Actor::User(address),
            origin: request_origin(parts),
        })
    }
}
