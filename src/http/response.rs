//! Error responses.
//!
//! Maps [`EscrowError`] to a status code and a JSON body
//! `{error, code, retry_after?}`. Internal failures are logged in full
//! but answered with a generic message.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::EscrowError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Handler error wrapper.
#[derive(Debug)]
pub struct ApiError(pub EscrowError);

impl From<EscrowError> for ApiError {
    fn from(err: EscrowError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &EscrowError) -> StatusCode {
    match err {
        EscrowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EscrowError::Forbidden(_) => StatusCode::FORBIDDEN,
        EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
        EscrowError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
        EscrowError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        EscrowError::RpcTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
        EscrowError::RpcPermanent(_) => StatusCode::BAD_GATEWAY,
        EscrowError::Encryption(_)
        | EscrowError::Decryption(_)
        | EscrowError::Storage(_)
        | EscrowError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let retry_after = match &self.0 {
            EscrowError::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = self.0.code(), error = %self.0, "Request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = ErrorBody {
            error: message,
            code: self.0.code(),
            retry_after,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&EscrowError::validation("x")), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(&EscrowError::conflict("x")), StatusCode::CONFLICT);
        assert_eq!(status_for(&EscrowError::RpcTransient("x".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&EscrowError::RpcPermanent("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&EscrowError::Decryption("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let response = ApiError(EscrowError::RateLimitExceeded { retry_after_secs: 30 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "30");
    }

    #[test]
    fn test_internal_errors_are_not_echoed() {
        let response = ApiError(EscrowError::Decryption("bad tag on v1:abcd".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
