//! Service-wide error taxonomy.
//!
//! Subsystems keep their own error enums (`CustodyError`, `BlockchainError`,
//! `StoreError`, `ConfigError`); everything that crosses the lifecycle engine
//! boundary is folded into [`EscrowError`].
//!
//! # Propagation
//! - Validation and permanent RPC errors surface to the caller immediately
//! - Transient RPC errors surface only after the dispatcher exhausts retries
//! - Audit write failures never surface here (see `audit::log`)

use thiserror::Error;

use crate::blockchain::types::BlockchainError;
use crate::custody::CustodyError;
use crate::store::StoreError;

/// Errors returned by escrow lifecycle operations.
#[derive(Debug, Error)]
pub enum EscrowError {
    /// Bad input or illegal state transition. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Actor is not allowed to perform the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Referenced escrow or milestone does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Master secret missing/malformed while encrypting.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Ciphertext failed authentication or the secret does not match.
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Network or node failure that survived every retry.
    #[error("Transient RPC error: {0}")]
    RpcTransient(String),

    /// Chain rejected the request; retrying will not help.
    #[error("Permanent RPC error: {0}")]
    RpcPermanent(String),

    /// Another payout for the same escrow/kind is already active.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Caller exceeded the allowed request rate.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Persistence layer failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Service misconfiguration detected at runtime.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for escrow operations.
pub type EscrowResult<T> = Result<T, EscrowError>;

impl EscrowError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Encryption(_) => "encryption_error",
            Self::Decryption(_) => "decryption_error",
            Self::RpcTransient(_) => "rpc_transient_error",
            Self::RpcPermanent(_) => "rpc_permanent_error",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "configuration_error",
        }
    }

    /// Whether the dispatcher may retry the failed broadcast.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcTransient(_))
    }
}

impl From<CustodyError> for EscrowError {
    fn from(err: CustodyError) -> Self {
        match err {
            CustodyError::Encryption(msg) => Self::Encryption(msg),
            CustodyError::Decryption(msg) => Self::Decryption(msg),
            CustodyError::KeyGeneration(msg) => Self::Encryption(msg),
        }
    }
}

impl From<BlockchainError> for EscrowError {
    fn from(err: BlockchainError) -> Self {
        if err.is_transient() {
            Self::RpcTransient(err.to_string())
        } else {
            Self::RpcPermanent(err.to_string())
        }
    }
}

impl From<StoreError> for EscrowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::ConcurrencyConflict(msg),
            StoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}
