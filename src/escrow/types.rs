//! Escrow and milestone records.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::custody::EncryptedKey;
use crate::escrow::timelock;

/// Escrow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Funded,
    Released,
    Disputed,
    Cancelled,
    Expired,
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 6] = [
        Self::Pending,
        Self::Funded,
        Self::Released,
        Self::Disputed,
        Self::Cancelled,
        Self::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::Released => "released",
            Self::Disputed => "disputed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// No lifecycle operation leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Escrow variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowVariant {
    Simple,
    TimeLocked,
    Milestone,
}

impl EscrowVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::TimeLocked => "time_locked",
            Self::Milestone => "milestone",
        }
    }
}

/// Milestone status. `Released` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Completed,
    Released,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Released => "released",
        }
    }
}

/// Currency-tagged decimal amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    pub value: Decimal,
    pub currency: String,
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// Who performed an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// An end user identified by wallet address.
    User(Address),
    /// Background sweeps (auto-release, funding detection, expiry).
    System,
}

impl Actor {
    pub fn address(&self) -> Option<Address> {
        match self {
            Self::User(address) => Some(*address),
            Self::System => None,
        }
    }

    pub fn is(&self, address: Address) -> bool {
        self.address() == Some(address)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(address) => write!(f, "{}", address),
            Self::System => f.write_str("system"),
        }
    }
}

/// A custodial escrow agreement.
///
/// Carries the sealed custody key; use [`EscrowView`] for anything that
/// leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub buyer: Address,
    pub seller: Address,
    pub amount: Amount,
    pub variant: EscrowVariant,
    pub status: EscrowStatus,
    pub release_date: Option<DateTime<Utc>>,
    pub auto_release: bool,
    pub custody_address: Address,
    pub encrypted_key: EncryptedKey,
    pub funding_tx_hash: Option<String>,
    pub dispute_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Escrow {
    pub fn is_party(&self, actor: &Actor) -> bool {
        actor.is(self.buyer) || actor.is(self.seller)
    }
}

/// A partial-amount sub-agreement of a milestone escrow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
    pub order_index: u32,
    pub status: MilestoneStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Public projection of an [`Escrow`]. Never contains key material.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowView {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub buyer: Address,
    pub seller: Address,
    pub amount: Amount,
    pub variant: EscrowVariant,
    pub status: EscrowStatus,
    pub release_date: Option<DateTime<Utc>>,
    /// Seconds left until `release_date` while the escrow is still open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_in_secs: Option<i64>,
    pub auto_release: bool,
    pub custody_address: Address,
    pub funding_tx_hash: Option<String>,
    pub dispute_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl EscrowView {
    /// Project `e` as seen at `now`.
    pub fn at(e: &Escrow, now: DateTime<Utc>) -> Self {
        let release_in_secs = if e.status.is_terminal() {
            None
        } else {
            timelock::time_until_release(e, now).map(|left| left.num_seconds())
        };
        Self {
            id: e.id,
            title: e.title.clone(),
            description: e.description.clone(),
            buyer: e.buyer,
            seller: e.seller,
            amount: e.amount.clone(),
            variant: e.variant,
            status: e.status,
            release_date: e.release_date,
            release_in_secs,
            auto_release: e.auto_release,
            custody_address: e.custody_address,
            funding_tx_hash: e.funding_tx_hash.clone(),
            dispute_reason: e.dispute_reason.clone(),
            created_at: e.created_at,
            funded_at: e.funded_at,
            released_at: e.released_at,
            cancelled_at: e.cancelled_at,
        }
    }
}

impl From<&Escrow> for EscrowView {
    fn from(e: &Escrow) -> Self {
        Self::at(e, Utc::now())
    }
}

/// Input for a new milestone.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMilestone {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub amount: Decimal,
}

/// Input for `create`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEscrow {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub buyer: String,
    pub seller: String,
    pub amount: Decimal,
    pub currency: String,
    pub variant: EscrowVariant,
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_release: bool,
    #[serde(default)]
    pub milestones: Vec<NewMilestone>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_is_snake_case() {
        let json = serde_json::to_string(&EscrowStatus::Funded).unwrap();
        assert_eq!(json, "\"funded\"");
        let variant: EscrowVariant = serde_json::from_str("\"time_locked\"").unwrap();
        assert_eq!(variant, EscrowVariant::TimeLocked);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(EscrowStatus::Released.is_terminal());
        assert!(EscrowStatus::Expired.is_terminal());
        assert!(!EscrowStatus::Disputed.is_terminal());
    }

    #[test]
    fn test_actor_display() {
        assert_eq!(Actor::System.to_string(), "system");
        assert!(Actor::User(Address::ZERO).is(Address::ZERO));
        assert!(!Actor::System.is(Address::ZERO));
    }

    #[test]
    fn test_view_counts_down_to_release() {
        let now = Utc::now();
        let mut escrow = Escrow {
            id: Uuid::new_v4(),
            title: "Lease deposit".into(),
            description: None,
            buyer: Address::repeat_byte(0xaa),
            seller: Address::repeat_byte(0xbb),
            amount: Amount {
                value: Decimal::ONE,
                currency: "ETH".into(),
            },
            variant: EscrowVariant::TimeLocked,
            status: EscrowStatus::Funded,
            release_date: Some(now + chrono::Duration::minutes(90)),
            auto_release: true,
            custody_address: Address::repeat_byte(0xcc),
            encrypted_key: EncryptedKey::new("v1:test".into()),
            funding_tx_hash: None,
            dispute_reason: None,
            created_at: now,
            updated_at: now,
            funded_at: Some(now),
            released_at: None,
            cancelled_at: None,
        };

        assert_eq!(EscrowView::at(&escrow, now).release_in_secs, Some(5_400));
        let json = serde_json::to_value(EscrowView::at(&escrow, now + chrono::Duration::hours(2))).unwrap();
        assert!(json.get("release_in_secs").is_none());

        escrow.status = EscrowStatus::Cancelled;
        assert_eq!(EscrowView::at(&escrow, now).release_in_secs, None);
    }

    #[test]
    fn test_new_escrow_defaults() {
        let input: NewEscrow = serde_json::from_str(
            r#"{"title":"Logo","buyer":"0x1","seller":"0x2","amount":"1.5","currency":"ETH","variant":"simple"}"#,
        )
        .unwrap();
        assert!(input.milestones.is_empty());
        assert!(!input.auto_release);
    }
}
