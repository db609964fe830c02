//! Webhook event types and the delivered JSON body.

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Events delivered to external subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEvent {
    #[serde(rename = "custody.wallet_created")]
    WalletCreated,
    #[serde(rename = "custody.funds_released")]
    FundsReleased,
    #[serde(rename = "custody.funds_refunded")]
    FundsRefunded,
    #[serde(rename = "custody.milestone_released")]
    MilestoneReleased,
    #[serde(rename = "custody.balance_low")]
    BalanceLow,
    #[serde(rename = "custody.dispute_opened")]
    DisputeOpened,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WalletCreated => "custody.wallet_created",
            Self::FundsReleased => "custody.funds_released",
            Self::FundsRefunded => "custody.funds_refunded",
            Self::MilestoneReleased => "custody.milestone_released",
            Self::BalanceLow => "custody.balance_low",
            Self::DisputeOpened => "custody.dispute_opened",
        }
    }

    /// Whether a subscriber's event list selects this event.
    ///
    /// An empty list selects everything. Entries may omit the `custody.` prefix.
    pub fn selected_by(&self, events: &[String]) -> bool {
        if events.is_empty() {
            return true;
        }
        let full = self.as_str();
        let short = full.trim_start_matches("custody.");
        events.iter().any(|e| e == full || e == short || e == "*")
    }
}

impl fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON body POSTed to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_type: WebhookEvent,
    pub escrow_id: Uuid,
    pub custody_address: Address,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    pub fn new(
        event_type: WebhookEvent,
        escrow_id: Uuid,
        custody_address: Address,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            escrow_id,
            custody_address,
            data,
            timestamp: Utc::now(),
        }
    }
}
