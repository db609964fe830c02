//! Payout types: the durable retry row and its request/receipt.

use alloy::primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::blockchain::types::SignedTransfer;

/// What a payout does to the escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    /// Seller payout of the whole custody balance.
    Release,
    /// Buyer refund of the whole custody balance.
    Refund,
    /// Seller payout of one milestone amount.
    Milestone,
}

impl PayoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Refund => "refund",
            Self::Milestone => "milestone",
        }
    }
}

impl fmt::Display for PayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Rows in these states block a second payout for the same key.
    pub fn blocks_new_payout(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

impl std::str::FromStr for PayoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown payout status '{}'", other)),
        }
    }
}

/// Exclusivity key: at most one active payout per key.
///
/// Release and refund both drain the custody wallet, so they share the
/// escrow-wide key (`milestone_id: None`); each milestone has its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayoutKey {
    pub escrow_id: Uuid,
    pub milestone_id: Option<Uuid>,
}

/// How much to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PayoutAmount {
    /// Exactly this many base units.
    Exact { wei: U256 },
    /// Whatever the custody wallet holds, minus the network fee.
    FullBalance,
}

/// A payout the lifecycle engine wants executed.
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    pub escrow_id: Uuid,
    pub kind: PayoutKind,
    pub milestone_id: Option<Uuid>,
    pub recipient: Address,
    pub amount: PayoutAmount,
    /// Agreement amount recorded in the audit trail.
    pub nominal_amount: Decimal,
    pub chain_id: u64,
    pub actor: String,
}

/// Durable retry state for one payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryableTransaction {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub kind: PayoutKind,
    pub milestone_id: Option<Uuid>,
    pub recipient: Address,
    pub amount: PayoutAmount,
    pub nominal_amount: Decimal,
    pub chain_id: u64,
    pub actor: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: PayoutStatus,
    pub last_error: Option<String>,
    /// Signed on the first attempt, before anything is sent; every later
    /// attempt resubmits these bytes.
    #[serde(default)]
    pub transfer: Option<SignedTransfer>,
    pub tx_hash: Option<TxHash>,
    pub sent_wei: Option<U256>,
    pub confirmations: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryableTransaction {
    pub fn new(request: PayoutRequest, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            escrow_id: request.escrow_id,
            kind: request.kind,
            milestone_id: request.milestone_id,
            recipient: request.recipient,
            amount: request.amount,
            nominal_amount: request.nominal_amount,
            chain_id: request.chain_id,
            actor: request.actor,
            attempts: 0,
            max_attempts,
            status: PayoutStatus::Pending,
            last_error: None,
            transfer: None,
            tx_hash: None,
            sent_wei: None,
            confirmations: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> PayoutKey {
        PayoutKey {
            escrow_id: self.escrow_id,
            milestone_id: self.milestone_id,
        }
    }

    pub fn attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Result of a completed payout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutReceipt {
    pub payout_id: Uuid,
    pub tx_hash: TxHash,
    pub sent_wei: U256,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PayoutRequest {
        PayoutRequest {
            escrow_id: Uuid::new_v4(),
            kind: PayoutKind::Release,
            milestone_id: None,
            recipient: Address::ZERO,
            amount: PayoutAmount::FullBalance,
            nominal_amount: Decimal::ONE,
            chain_id: 31337,
            actor: "system".into(),
        }
    }

    #[test]
    fn test_new_row_is_pending() {
        let row = RetryableTransaction::new(request(), 3);
        assert_eq!(row.status, PayoutStatus::Pending);
        assert_eq!(row.attempts, 0);
        assert!(row.attempts_left());
    }

    #[test]
    fn test_failed_rows_do_not_block() {
        assert!(PayoutStatus::Pending.blocks_new_payout());
        assert!(PayoutStatus::Processing.blocks_new_payout());
        assert!(PayoutStatus::Completed.blocks_new_payout());
        assert!(!PayoutStatus::Failed.blocks_new_payout());
    }

    #[test]
    fn test_release_and_refund_share_a_key() {
        let release = RetryableTransaction::new(request(), 3);
        let refund = RetryableTransaction::new(
            PayoutRequest {
                escrow_id: release.escrow_id,
                kind: PayoutKind::Refund,
                ..request()
            },
            3,
        );
        assert_eq!(release.key(), refund.key());

        let milestone = RetryableTransaction::new(
            PayoutRequest {
                escrow_id: release.escrow_id,
                kind: PayoutKind::Milestone,
                milestone_id: Some(Uuid::new_v4()),
                ..request()
            },
            3,
        );
        assert_ne!(release.key(), milestone.key());
    }

    #[test]
    fn test_amount_serde_is_tagged() {
        let json = serde_json::to_value(PayoutAmount::FullBalance).unwrap();
        assert_eq!(json["mode"], "full_balance");
        let parsed: PayoutStatus = "processing".parse().unwrap();
        assert_eq!(parsed, PayoutStatus::Processing);
    }
}
