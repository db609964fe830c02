//! Chain-specific types, error definitions and unit conversion.

use alloy::primitives::{Bytes, TxHash, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Re-export BlockchainConfig from config module to avoid duplication
pub use crate::config::schema::BlockchainConfig;

/// Chain ID type for strong typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub u64);

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChainId> for u64 {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

/// Errors that can occur during blockchain operations.
#[derive(Debug, Error)]
pub enum BlockchainError {
    /// Network/node failure that may succeed on retry.
    #[error("RPC error: {0}")]
    Transient(String),

    /// Request rejected by the node; retrying will not help.
    #[error("RPC rejected request: {0}")]
    Permanent(String),

    /// RPC request timed out.
    #[error("RPC timeout after {0} ms")]
    Timeout(u64),

    /// Invalid private key or signing failure.
    #[error("Wallet error: {0}")]
    Wallet(String),

    /// Gas price exceeded maximum allowed.
    #[error("Gas price {current_gwei} gwei exceeds maximum {max_gwei} gwei")]
    GasPriceTooHigh { current_gwei: u64, max_gwei: u64 },

    /// Custody balance cannot cover the network fee.
    #[error("Insufficient balance: have {balance} wei, need {required} wei")]
    InsufficientBalance { balance: U256, required: U256 },

    /// Chain configuration mismatch.
    #[error("Chain ID mismatch: expected {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },

    /// Amount cannot be represented in base units.
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed account address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl BlockchainError {
    /// Whether a retry has a chance of succeeding.
    ///
    /// Gas spikes are transient: the price may drop before the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::GasPriceTooHigh { .. }
        )
    }
}

/// Result type for blockchain operations.
pub type BlockchainResult<T> = Result<T, BlockchainError>;

/// Transaction confirmation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Transaction is pending in mempool.
    Pending,
    /// Transaction has been mined but not enough confirmations.
    Confirming { current: u64, required: u64 },
    /// Transaction is confirmed with required block depth.
    Confirmed { confirmations: u64 },
    /// Transaction failed or was dropped.
    Failed(String),
}

/// A signed value transfer, ready to submit.
///
/// Submitting the same `raw` bytes twice can only ever land one
/// transaction, since both carry the same sender nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransfer {
    pub tx_hash: TxHash,
    pub nonce: u64,
    pub value: U256,
    pub raw: Bytes,
}

fn pow10(exp: u32) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// Convert a decimal amount (e.g. 1.5 ETH) to base units (wei).
///
/// Amounts with more fractional digits than `decimals` are rejected, never rounded.
pub fn to_base_units(amount: Decimal, decimals: u32) -> BlockchainResult<U256> {
    if amount.is_sign_negative() {
        return Err(BlockchainError::InvalidAmount(format!("negative amount {}", amount)));
    }
    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > decimals {
        return Err(BlockchainError::InvalidAmount(format!(
            "{} has more than {} decimal places",
            amount, decimals
        )));
    }
    let mantissa = u128::try_from(normalized.mantissa())
        .map_err(|_| BlockchainError::InvalidAmount(format!("amount {} out of range", amount)))?;
    Ok(U256::from(mantissa) * pow10(decimals - scale))
}

/// Convert base units (wei) back to a decimal amount.
pub fn from_base_units(value: U256, decimals: u32) -> BlockchainResult<Decimal> {
    let raw = u128::try_from(value)
        .ok()
        .and_then(|v| i128::try_from(v).ok())
        .ok_or_else(|| BlockchainError::InvalidAmount(format!("{} wei out of range", value)))?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .map(|d| d.normalize())
        .map_err(|e| BlockchainError::InvalidAmount(e.to_string()))
}
