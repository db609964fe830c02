//! Audit entry model.
//!
//! Every custody-sensitive action is one [`AuditAction`] variant carrying
//! its own typed payload. Genuinely unstructured extras go in
//! [`AuditEntry::metadata`].

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::payments::types::PayoutKind;

/// Outcome details shared by every successful payout entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutOutcome {
    pub payout_id: Uuid,
    pub attempts: u32,
    pub retry_successful: bool,
    /// Base units actually sent, after the network fee.
    pub sent_wei: String,
}

/// Known audit action kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details", rename_all = "snake_case")]
pub enum AuditAction {
    WalletCreated,
    KeyDecrypted {
        payout_id: Uuid,
        purpose: PayoutKind,
    },
    BalanceChecked {
        balance_wei: String,
        sufficient: bool,
    },
    EscrowFunded,
    AutoFunded {
        balance_wei: String,
    },
    FundsReleased(PayoutOutcome),
    FundsRefunded(PayoutOutcome),
    MilestoneCompleted {
        milestone_id: Uuid,
    },
    MilestoneReleased {
        milestone_id: Uuid,
        outcome: PayoutOutcome,
    },
    DisputeOpened {
        reason: String,
    },
    EscrowCancelled {
        refunded: bool,
    },
    EscrowExpired,
    PayoutFailed {
        payout_id: Uuid,
        kind: PayoutKind,
        attempts: u32,
        error: String,
    },
}

impl AuditAction {
    /// Stable snake_case name used in filters, exports and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WalletCreated => "wallet_created",
            Self::KeyDecrypted { .. } => "key_decrypted",
            Self::BalanceChecked { .. } => "balance_checked",
            Self::EscrowFunded => "escrow_funded",
            Self::AutoFunded { .. } => "auto_funded",
            Self::FundsReleased(_) => "funds_released",
            Self::FundsRefunded(_) => "funds_refunded",
            Self::MilestoneCompleted { .. } => "milestone_completed",
            Self::MilestoneReleased { .. } => "milestone_released",
            Self::DisputeOpened { .. } => "dispute_opened",
            Self::EscrowCancelled { .. } => "escrow_cancelled",
            Self::EscrowExpired => "escrow_expired",
            Self::PayoutFailed { .. } => "payout_failed",
        }
    }
}

/// Request origin attached to entries written on behalf of an HTTP caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOrigin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub action: AuditAction,
    pub actor: String,
    pub custody_address: Option<Address>,
    pub amount: Option<Decimal>,
    pub tx_hash: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(escrow_id: Uuid, action: AuditAction, actor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            action,
            actor: actor.into(),
            custody_address: None,
            amount: None,
            tx_hash: None,
            ip_address: None,
            user_agent: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn custody(mut self, address: Address) -> Self {
        self.custody_address = Some(address);
        self
    }

    pub fn amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn tx_hash(mut self, hash: impl Into<String>) -> Self {
        self.tx_hash = Some(hash.into());
        self
    }

    pub fn origin(mut self, origin: &RequestOrigin) -> Self {
        self.ip_address = origin.ip_address.clone();
        self.user_agent = origin.user_agent.clone();
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Query selector. Results are newest-first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub escrow_id: Option<Uuid>,
    pub custody_address: Option<Address>,
    pub action: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_escrow(escrow_id: Uuid) -> Self {
        Self {
            escrow_id: Some(escrow_id),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.escrow_id.map_or(true, |id| entry.escrow_id == id)
            && self
                .custody_address
                .map_or(true, |addr| entry.custody_address == Some(addr))
            && self
                .action
                .as_deref()
                .map_or(true, |action| entry.action.name() == action)
            && self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp <= until)
    }
}

/// Read-side projection over a set of entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditStatistics {
    pub total_entries: u64,
    pub by_action: BTreeMap<String, u64>,
    pub wallet_creations: u64,
    pub keys_decrypted: u64,
    pub funds_released_count: u64,
    pub funds_released_total: Decimal,
    pub funds_refunded_count: u64,
    pub funds_refunded_total: Decimal,
    pub milestones_released: u64,
    pub failed_payouts: u64,
    pub first_entry: Option<DateTime<Utc>>,
    pub last_entry: Option<DateTime<Utc>>,
}

impl AuditStatistics {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditEntry>) -> Self {
        let mut stats = Self::default();

        for entry in entries {
            stats.total_entries += 1;
            *stats
                .by_action
                .entry(entry.action.name().to_string())
                .or_default() += 1;

            let amount = entry.amount.unwrap_or_default();
            match &entry.action {
                AuditAction::WalletCreated => stats.wallet_creations += 1,
                AuditAction::KeyDecrypted { .. } => stats.keys_decrypted += 1,
                AuditAction::FundsReleased(_) => {
                    stats.funds_released_count += 1;
                    stats.funds_released_total += amount;
                }
                AuditAction::FundsRefunded(_) => {
                    stats.funds_refunded_count += 1;
                    stats.funds_refunded_total += amount;
                }
                AuditAction::MilestoneReleased { .. } => stats.milestones_released += 1,
                AuditAction::PayoutFailed { .. } => stats.failed_payouts += 1,
                _ => {}
            }

            stats.first_entry = Some(match stats.first_entry {
                Some(first) => first.min(entry.timestamp),
                None => entry.timestamp,
            });
            stats.last_entry = Some(match stats.last_entry {
                Some(last) => last.max(entry.timestamp),
                None => entry.timestamp,
            });
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn outcome() -> PayoutOutcome {
        PayoutOutcome {
            payout_id: Uuid::nil(),
            attempts: 2,
            retry_successful: true,
            sent_wei: "1".into(),
        }
    }

    #[test]
    fn test_action_serializes_with_type_tag() {
        let json = serde_json::to_value(AuditAction::FundsReleased(outcome())).unwrap();
        assert_eq!(json["type"], "funds_released");
        assert_eq!(json["details"]["retry_successful"], true);

        let json = serde_json::to_value(AuditAction::WalletCreated).unwrap();
        assert_eq!(json["type"], "wallet_created");
    }

    #[test]
    fn test_milestone_release_round_trips() {
        let action = AuditAction::MilestoneReleased {
            milestone_id: Uuid::new_v4(),
            outcome: outcome(),
        };
        let json = serde_json::to_string(&action).unwrap();
        let parsed: AuditAction = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn test_filter_matching() {
        let escrow = Uuid::new_v4();
        let entry = AuditEntry::new(escrow, AuditAction::WalletCreated, "system");

        assert!(AuditFilter::for_escrow(escrow).matches(&entry));
        assert!(!AuditFilter::for_escrow(Uuid::new_v4()).matches(&entry));

        let filter = AuditFilter {
            action: Some("funds_released".into()),
            ..AuditFilter::default()
        };
        assert!(!filter.matches(&entry));
    }

    #[test]
    fn test_statistics_projection() {
        let escrow = Uuid::new_v4();
        let entries = vec![
            AuditEntry::new(escrow, AuditAction::WalletCreated, "a"),
            AuditEntry::new(escrow, AuditAction::FundsReleased(outcome()), "a")
                .amount(Decimal::from_str("1.5").unwrap()),
            AuditEntry::new(escrow, AuditAction::FundsRefunded(outcome()), "b")
                .amount(Decimal::from_str("0.25").unwrap()),
            AuditEntry::new(escrow, AuditAction::FundsReleased(outcome()), "a")
                .amount(Decimal::from_str("2").unwrap()),
        ];

        let stats = AuditStatistics::from_entries(&entries);
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.wallet_creations, 1);
        assert_eq!(stats.funds_released_count, 2);
        assert_eq!(stats.funds_released_total, Decimal::from_str("3.5").unwrap());
        assert_eq!(stats.funds_refunded_total, Decimal::from_str("0.25").unwrap());
        assert_eq!(stats.by_action["funds_released"], 2);
        assert!(stats.first_entry <= stats.last_entry);
    }
}
