//! Escrow lifecycle engine.
//!
//! # Responsibilities
//! - Validate and create escrows (one custody wallet each)
//! - Enforce the state machine and role rules for every transition
//! - Hand payouts to the [`TransactionDispatcher`] and advance status only
//!   after it reports success
//! - Emit audit entries and webhooks for every transition
//!
//! # State machine
//! ```text
//! pending ──mark_funded / auto-funded──▶ funded ──release──▶ released
//!    │                                    │  │
//!    ├──cancel──▶ cancelled ◀──cancel─────┘  └──open_dispute──▶ disputed
//!    └──funding timeout──▶ expired
//! ```
//!
//! # Design Decisions
//! - Every status write is a compare-and-swap against the status that was read
//! - A failed payout leaves the escrow exactly as it was
//! - Finalizing after a completed payout is idempotent; the recovery sweep
//!   reuses it for payouts that completed before a crash

use alloy::primitives::{Address, TxHash};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEntry, AuditFilter, AuditLog};
use crate::blockchain::client::ChainRpc;
use crate::blockchain::types::{from_base_units, to_base_units};
use crate::blockchain::wallet::parse_address;
use crate::config::ServiceConfig;
use crate::custody::KeyVault;
use crate::error::{EscrowError, EscrowResult};
use crate::escrow::timelock;
use crate::escrow::types::{
    Actor, Amount, Escrow, EscrowStatus, EscrowVariant, EscrowView, Milestone, MilestoneStatus,
    NewEscrow,
};
use crate::observability::metrics;
use crate::payments::{
    PayoutAmount, PayoutKind, PayoutReceipt, PayoutRequest, PayoutStatus, RetryableTransaction,
    TransactionDispatcher,
};
use crate::security::access_control::ActorContext;
use crate::store::{EscrowStore, StoreError};
use crate::webhooks::{WebhookEvent, WebhookNotifier, WebhookPayload};

/// Largest allowed gap between the milestone sum and the escrow total.
pub const MILESTONE_SUM_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Audit entries returned with `get`.
pub const ACTIVITY_LIMIT: usize = 50;

const MAX_FUNDING_TIMEOUT_HOURS: u64 = 24 * 365 * 10;

/// Compare-and-swap retries when finalizing after a payout.
const FINALIZE_RETRIES: usize = 5;

/// Chain and policy settings the engine needs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub native_currency: String,
    pub currency_decimals: u32,
    pub chain_id: u64,
    /// Pending escrows older than this expire; `None` disables expiry.
    pub funding_timeout: Option<ChronoDuration>,
}

impl EngineSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let hours = config.sweeps.funding_timeout_hours;
        Self {
            native_currency: config.blockchain.native_currency.clone(),
            currency_decimals: config.blockchain.currency_decimals,
            chain_id: config.blockchain.chain_id,
            funding_timeout: (hours > 0).then(|| ChronoDuration::hours(hours.min(MAX_FUNDING_TIMEOUT_HOURS) as i64)),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            native_currency: "ETH".to_string(),
            currency_decimals: 18,
            chain_id: 1,
            funding_timeout: None,
        }
    }
}

/// Escrow, milestones and recent activity.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowDetails {
    pub escrow: EscrowView,
    pub milestones: Vec<Milestone>,
    pub activities: Vec<AuditEntry>,
}

/// Result of a milestone release.
#[derive(Debug, Clone, Serialize)]
pub struct MilestoneRelease {
    pub milestone: Milestone,
    pub escrow: EscrowView,
    pub tx_hash: TxHash,
}

/// Custody balance as seen on chain.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceReport {
    pub escrow_id: Uuid,
    pub custody_address: Address,
    pub balance_wei: String,
    pub balance: Decimal,
    pub required: Decimal,
    pub sufficient: bool,
}

/// The only component that changes escrow status.
pub struct EscrowEngine {
    escrows: Arc<dyn EscrowStore>,
    vault: Arc<KeyVault>,
    rpc: Arc<dyn ChainRpc>,
    dispatcher: Arc<TransactionDispatcher>,
    audit: AuditLog,
    webhooks: WebhookNotifier,
    settings: EngineSettings,
}

impl EscrowEngine {
    pub fn new(
        escrows: Arc<dyn EscrowStore>,
        vault: Arc<KeyVault>,
        rpc: Arc<dyn ChainRpc>,
        dispatcher: Arc<TransactionDispatcher>,
        audit: AuditLog,
        webhooks: WebhookNotifier,
        settings: EngineSettings,
    ) -> Self {
        Self {
            escrows,
            vault,
            rpc,
            dispatcher,
            audit,
            webhooks,
            settings,
        }
    }

    pub fn dispatcher(&self) -> &Arc<TransactionDispatcher> {
        &self.dispatcher
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate the agreement, create its custody wallet and persist it as `pending`.
    pub async fn create(&self, input: NewEscrow, ctx: &ActorContext) -> EscrowResult<EscrowView> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(EscrowError::validation("title must not be empty"));
        }

        let buyer = parse_address(&input.buyer)
            .map_err(|_| EscrowError::validation(format!("invalid buyer address '{}'", input.buyer)))?;
        let seller = parse_address(&input.seller)
            .map_err(|_| EscrowError::validation(format!("invalid seller address '{}'", input.seller)))?;
        if buyer == seller {
            return Err(EscrowError::validation("buyer and seller must differ"));
        }

        self.validate_amount(input.amount, "amount")?;
        if !input.currency.eq_ignore_ascii_case(&self.settings.native_currency) {
            return Err(EscrowError::validation(format!(
                "unsupported currency '{}', expected {}",
                input.currency, self.settings.native_currency
            )));
        }

        if input.variant == EscrowVariant::TimeLocked && input.release_date.is_none() {
            return Err(EscrowError::validation("time_locked escrows require a release_date"));
        }

        match input.variant {
            EscrowVariant::Milestone => {
                if input.milestones.is_empty() {
                    return Err(EscrowError::validation("milestone escrows require milestones"));
                }
                let mut sum = Decimal::ZERO;
                for (i, m) in input.milestones.iter().enumerate() {
                    if m.title.trim().is_empty() {
                        return Err(EscrowError::validation(format!("milestone {} has no title", i + 1)));
                    }
                    self.validate_amount(m.amount, &format!("milestone {} amount", i + 1))?;
                    sum += m.amount;
                }
                if (sum - input.amount).abs() > MILESTONE_SUM_TOLERANCE {
                    return Err(EscrowError::validation(format!(
                        "milestone amounts sum to {}, escrow total is {}",
                        sum, input.amount
                    )));
                }
            }
            _ if !input.milestones.is_empty() => {
                return Err(EscrowError::validation("only milestone escrows may define milestones"));
            }
            _ => {}
        }

        let wallet = self.vault.create_custody_wallet()?;
        if wallet.address == buyer || wallet.address == seller {
            return Err(EscrowError::Encryption(
                "generated custody address collides with a party".to_string(),
            ));
        }

        let now = Utc::now();
        let escrow = Escrow {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: input.description,
            buyer,
            seller,
            amount: Amount {
                value: input.amount,
                currency: self.settings.native_currency.clone(),
            },
            variant: input.variant,
            status: EscrowStatus::Pending,
            release_date: input.release_date,
            auto_release: input.auto_release,
            custody_address: wallet.address,
            encrypted_key: wallet.encrypted_key,
            funding_tx_hash: None,
            dispute_reason: None,
            created_at: now,
            updated_at: now,
            funded_at: None,
            released_at: None,
            cancelled_at: None,
        };
        let milestones: Vec<Milestone> = input
            .milestones
            .into_iter()
            .enumerate()
            .map(|(i, m)| Milestone {
                id: Uuid::new_v4(),
                escrow_id: escrow.id,
                title: m.title.trim().to_string(),
                description: m.description,
                amount: m.amount,
                order_index: i as u32,
                status: MilestoneStatus::Pending,
                completed_at: None,
                released_at: None,
            })
            .collect();

        self.escrows.insert_escrow(escrow.clone(), milestones).await?;

        self.audit.append(
            AuditEntry::new(escrow.id, AuditAction::WalletCreated, ctx.actor.to_string())
                .custody(escrow.custody_address)
                .amount(escrow.amount.value)
                .origin(&ctx.origin)
                .meta("variant", escrow.variant.as_str()),
        );
        self.emit(
            WebhookEvent::WalletCreated,
            &escrow,
            serde_json::json!({
                "amount": escrow.amount.value.to_string(),
                "currency": escrow.amount.currency,
                "buyer": escrow.buyer,
                "seller": escrow.seller,
            }),
        );
        metrics::record_transition(EscrowStatus::Pending.as_str());

        tracing::info!(
            escrow_id = %escrow.id,
            custody_address = %escrow.custody_address,
            amount = %escrow.amount,
            "Escrow created"
        );
        Ok(EscrowView::from(&escrow))
    }

    /// Escrow view, milestones and the newest audit entries.
    pub async fn get(&self, escrow_id: Uuid) -> EscrowResult<EscrowDetails> {
        let escrow = self.escrows.get_escrow(escrow_id).await?;
        let milestones = self.escrows.list_milestones(escrow_id).await?;
        let activities = self
            .audit
            .query(&AuditFilter::for_escrow(escrow_id).limit(ACTIVITY_LIMIT))
            .await?;
        Ok(EscrowDetails {
            escrow: EscrowView::from(&escrow),
            milestones,
            activities,
        })
    }

    /// Escrow view only, without milestones or activity.
    pub async fn find(&self, escrow_id: Uuid) -> EscrowResult<EscrowView> {
        let escrow = self.escrows.get_escrow(escrow_id).await?;
        Ok(EscrowView::from(&escrow))
    }

    pub async fn list(&self, status: Option<EscrowStatus>) -> EscrowResult<Vec<EscrowView>> {
        let escrows = self.escrows.list_escrows(status).await?;
        Ok(escrows.iter().map(EscrowView::from).collect())
    }

    /// Buyer reports the funding transaction.
    pub async fn mark_funded(&self, escrow_id: Uuid, tx_hash: &str, ctx: &ActorContext) -> EscrowResult<EscrowView> {
        let mut escrow = self.escrows.get_escrow(escrow_id).await?;
        if !ctx.actor.is(escrow.buyer) {
            return Err(EscrowError::forbidden("only the buyer can mark an escrow funded"));
        }
        require_status(&escrow, EscrowStatus::Pending)?;
        let tx_hash = tx_hash.trim();
        if tx_hash.is_empty() {
            return Err(EscrowError::validation("tx_hash must not be empty"));
        }

        let now = Utc::now();
        escrow.status = EscrowStatus::Funded;
        escrow.funding_tx_hash = Some(tx_hash.to_string());
        escrow.funded_at = Some(now);
        escrow.updated_at = now;
        self.escrows
            .compare_and_set_escrow(escrow.clone(), EscrowStatus::Pending)
            .await?;

        self.audit.append(
            AuditEntry::new(escrow.id, AuditAction::EscrowFunded, ctx.actor.to_string())
                .custody(escrow.custody_address)
                .amount(escrow.amount.value)
                .tx_hash(tx_hash)
                .origin(&ctx.origin),
        );
        metrics::record_transition(EscrowStatus::Funded.as_str());
        tracing::info!(escrow_id = %escrow.id, tx_hash, "Escrow funded");
        Ok(EscrowView::from(&escrow))
    }

    /// Pay the seller the full custody balance and mark the escrow released.
    pub async fn release(&self, escrow_id: Uuid, ctx: &ActorContext) -> EscrowResult<EscrowView> {
        let escrow = self.escrows.get_escrow(escrow_id).await?;
        if !(ctx.actor.is(escrow.buyer) || ctx.actor == Actor::System) {
            return Err(EscrowError::forbidden("only the buyer can release funds"));
        }
        if escrow.variant == EscrowVariant::Milestone {
            return Err(EscrowError::validation(
                "milestone escrows are released milestone by milestone",
            ));
        }
        require_status(&escrow, EscrowStatus::Funded)?;

        let receipt = self
            .dispatcher
            .submit(PayoutRequest {
                escrow_id: escrow.id,
                kind: PayoutKind::Release,
                milestone_id: None,
                recipient: escrow.seller,
                amount: PayoutAmount::FullBalance,
                nominal_amount: escrow.amount.value,
                chain_id: self.settings.chain_id,
                actor: ctx.actor.to_string(),
            })
            .await?;

        self.finalize_release(escrow.id, &receipt).await
    }

    /// Seller signals a milestone is done. Moves no funds.
    pub async fn complete_milestone(&self, milestone_id: Uuid, ctx: &ActorContext) -> EscrowResult<Milestone> {
        let mut milestone = self.escrows.get_milestone(milestone_id).await?;
        let escrow = self.escrows.get_escrow(milestone.escrow_id).await?;
        if !ctx.actor.is(escrow.seller) {
            return Err(EscrowError::forbidden("only the seller can complete a milestone"));
        }
        require_status(&escrow, EscrowStatus::Funded)?;
        if milestone.status != MilestoneStatus::Pending {
            return Err(EscrowError::validation(format!(
                "milestone is {}, expected pending",
                milestone.status.as_str()
            )));
        }

        milestone.status = MilestoneStatus::Completed;
        milestone.completed_at = Some(Utc::now());
        self.escrows
            .compare_and_set_milestone(milestone.clone(), MilestoneStatus::Pending)
            .await?;

        self.audit.append(
            AuditEntry::new(
                escrow.id,
                AuditAction::MilestoneCompleted { milestone_id },
                ctx.actor.to_string(),
            )
            .custody(escrow.custody_address)
            .amount(milestone.amount)
            .origin(&ctx.origin),
        );
        tracing::info!(escrow_id = %escrow.id, milestone_id = %milestone_id, "Milestone completed");
        Ok(milestone)
    }

    /// Buyer approves a milestone: pay its amount to the seller.
    ///
    /// The final milestone drains the custody wallet instead, so an escrow
    /// funded with exactly its total can always finish.
    pub async fn release_milestone(&self, milestone_id: Uuid, ctx: &ActorContext) -> EscrowResult<MilestoneRelease> {
        let milestone = self.escrows.get_milestone(milestone_id).await?;
        let escrow = self.escrows.get_escrow(milestone.escrow_id).await?;
        if !ctx.actor.is(escrow.buyer) {
            return Err(EscrowError::forbidden("only the buyer can release a milestone"));
        }
        require_status(&escrow, EscrowStatus::Funded)?;
        if milestone.status == MilestoneStatus::Released {
            return Err(EscrowError::validation("milestone already released"));
        }

        // Transfer fees come out of the custody wallet, so the last
        // outstanding milestone takes whatever is left.
        let outstanding = self
            .escrows
            .list_milestones(escrow.id)
            .await?
            .iter()
            .filter(|m| m.id != milestone.id && m.status != MilestoneStatus::Released)
            .count();
        let amount = if outstanding == 0 {
            PayoutAmount::FullBalance
        } else {
            let wei = to_base_units(milestone.amount, self.settings.currency_decimals)
                .map_err(|e| EscrowError::validation(e.to_string()))?;
            PayoutAmount::Exact { wei }
        };

        let receipt = self
            .dispatcher
            .submit(PayoutRequest {
                escrow_id: escrow.id,
                kind: PayoutKind::Milestone,
                milestone_id: Some(milestone.id),
                recipient: escrow.seller,
                amount,
                nominal_amount: milestone.amount,
                chain_id: self.settings.chain_id,
                actor: ctx.actor.to_string(),
            })
            .await?;

        let (milestone, escrow) = self.finalize_milestone(milestone.id, receipt.tx_hash).await?;
        Ok(MilestoneRelease {
            milestone,
            escrow,
            tx_hash: receipt.tx_hash,
        })
    }

    /// Cancel a pending escrow, or refund and cancel a funded one.
    pub async fn cancel(&self, escrow_id: Uuid, ctx: &ActorContext) -> EscrowResult<EscrowView> {
        let mut escrow = self.escrows.get_escrow(escrow_id).await?;
        match escrow.status {
            EscrowStatus::Pending => {
                if !escrow.is_party(&ctx.actor) {
                    return Err(EscrowError::forbidden("only a party can cancel the escrow"));
                }
                let now = Utc::now();
                escrow.status = EscrowStatus::Cancelled;
                escrow.cancelled_at = Some(now);
                escrow.updated_at = now;
                self.escrows
                    .compare_and_set_escrow(escrow.clone(), EscrowStatus::Pending)
                    .await?;

                self.audit.append(
                    AuditEntry::new(
                        escrow.id,
                        AuditAction::EscrowCancelled { refunded: false },
                        ctx.actor.to_string(),
                    )
                    .custody(escrow.custody_address)
                    .origin(&ctx.origin),
                );
                metrics::record_transition(EscrowStatus::Cancelled.as_str());
                tracing::info!(escrow_id = %escrow.id, "Escrow cancelled before funding");
                Ok(EscrowView::from(&escrow))
            }
            EscrowStatus::Funded => {
                if !ctx.actor.is(escrow.seller) {
                    return Err(EscrowError::forbidden(
                        "only the seller can cancel a funded escrow",
                    ));
                }
                let receipt = self
                    .dispatcher
                    .submit(PayoutRequest {
                        escrow_id: escrow.id,
                        kind: PayoutKind::Refund,
                        milestone_id: None,
                        recipient: escrow.buyer,
                        amount: PayoutAmount::FullBalance,
                        nominal_amount: escrow.amount.value,
                        chain_id: self.settings.chain_id,
                        actor: ctx.actor.to_string(),
                    })
                    .await?;
                self.finalize_refund(escrow.id, &receipt).await
            }
            other => Err(EscrowError::validation(format!(
                "escrow is {}, cannot cancel",
                other
            ))),
        }
    }

    /// Freeze a funded escrow pending external resolution.
    pub async fn open_dispute(&self, escrow_id: Uuid, reason: &str, ctx: &ActorContext) -> EscrowResult<EscrowView> {
        let mut escrow = self.escrows.get_escrow(escrow_id).await?;
        if !escrow.is_party(&ctx.actor) {
            return Err(EscrowError::forbidden("only a party can open a dispute"));
        }
        require_status(&escrow, EscrowStatus::Funded)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(EscrowError::validation("dispute reason must not be empty"));
        }

        escrow.status = EscrowStatus::Disputed;
        escrow.dispute_reason = Some(reason.to_string());
        escrow.updated_at = Utc::now();
        self.escrows
            .compare_and_set_escrow(escrow.clone(), EscrowStatus::Funded)
            .await?;

        self.audit.append(
            AuditEntry::new(
                escrow.id,
                AuditAction::DisputeOpened {
                    reason: reason.to_string(),
                },
                ctx.actor.to_string(),
            )
            .custody(escrow.custody_address)
            .origin(&ctx.origin),
        );
        self.emit(
            WebhookEvent::DisputeOpened,
            &escrow,
            serde_json::json!({ "reason": reason, "opened_by": ctx.actor.to_string() }),
        );
        metrics::record_transition(EscrowStatus::Disputed.as_str());
        tracing::warn!(escrow_id = %escrow.id, "Dispute opened");
        Ok(EscrowView::from(&escrow))
    }

    /// Query the custody balance and compare it with the agreed amount.
    pub async fn check_balance(&self, escrow_id: Uuid, ctx: &ActorContext) -> EscrowResult<BalanceReport> {
        let escrow = self.escrows.get_escrow(escrow_id).await?;
        if !(escrow.is_party(&ctx.actor) || ctx.actor == Actor::System) {
            return Err(EscrowError::forbidden("only a party can check the custody balance"));
        }

        let wei = self.rpc.get_balance(escrow.custody_address).await?;
        let balance = from_base_units(wei, self.settings.currency_decimals)?;
        let sufficient = balance >= escrow.amount.value;

        self.audit.append(
            AuditEntry::new(
                escrow.id,
                AuditAction::BalanceChecked {
                    balance_wei: wei.to_string(),
                    sufficient,
                },
                ctx.actor.to_string(),
            )
            .custody(escrow.custody_address)
            .amount(balance)
            .origin(&ctx.origin),
        );

        if escrow.status == EscrowStatus::Funded && !sufficient {
            tracing::warn!(escrow_id = %escrow.id, balance = %balance, required = %escrow.amount.value, "Custody balance below escrow amount");
            self.emit(
                WebhookEvent::BalanceLow,
                &escrow,
                serde_json::json!({
                    "balance": balance.to_string(),
                    "required": escrow.amount.value.to_string(),
                }),
            );
        }

        Ok(BalanceReport {
            escrow_id: escrow.id,
            custody_address: escrow.custody_address,
            balance_wei: wei.to_string(),
            balance,
            required: escrow.amount.value,
            sufficient,
        })
    }

    /// Move pending escrows whose custody wallet holds the full amount to `funded`.
    pub async fn detect_funding(&self) -> EscrowResult<usize> {
        let mut funded = 0;
        for mut escrow in self.escrows.list_escrows(Some(EscrowStatus::Pending)).await? {
            let wei = match self.rpc.get_balance(escrow.custody_address).await {
                Ok(wei) => wei,
                Err(e) => {
                    tracing::warn!(escrow_id = %escrow.id, error = %e, "Funding check failed");
                    continue;
                }
            };
            let balance = match from_base_units(wei, self.settings.currency_decimals) {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::warn!(escrow_id = %escrow.id, error = %e, "Unrepresentable custody balance");
                    continue;
                }
            };
            if balance < escrow.amount.value {
                continue;
            }

            let now = Utc::now();
            escrow.status = EscrowStatus::Funded;
            escrow.funded_at = Some(now);
            escrow.updated_at = now;
            match self
                .escrows
                .compare_and_set_escrow(escrow.clone(), EscrowStatus::Pending)
                .await
            {
                Ok(()) => {}
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }

            self.audit.append(
                AuditEntry::new(
                    escrow.id,
                    AuditAction::AutoFunded {
                        balance_wei: wei.to_string(),
                    },
                    Actor::System.to_string(),
                )
                .custody(escrow.custody_address)
                .amount(balance),
            );
            metrics::record_transition(EscrowStatus::Funded.as_str());
            tracing::info!(escrow_id = %escrow.id, balance = %balance, "Escrow funding detected");
            funded += 1;
        }
        Ok(funded)
    }

    /// Expire pending escrows past the funding window.
    pub async fn expire(&self, now: DateTime<Utc>) -> EscrowResult<usize> {
        if self.settings.funding_timeout.is_none() {
            return Ok(0);
        }
        let mut expired = 0;
        for mut escrow in self.escrows.list_escrows(Some(EscrowStatus::Pending)).await? {
            if !timelock::funding_expired_at(&escrow, self.settings.funding_timeout, now) {
                continue;
            }
            escrow.status = EscrowStatus::Expired;
            escrow.updated_at = now;
            match self
                .escrows
                .compare_and_set_escrow(escrow.clone(), EscrowStatus::Pending)
                .await
            {
                Ok(()) => {}
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }

            self.audit.append(
                AuditEntry::new(escrow.id, AuditAction::EscrowExpired, Actor::System.to_string())
                    .custody(escrow.custody_address),
            );
            metrics::record_transition(EscrowStatus::Expired.as_str());
            tracing::info!(escrow_id = %escrow.id, "Unfunded escrow expired");
            expired += 1;
        }
        Ok(expired)
    }

    /// Release every time-locked escrow whose release date has passed.
    pub async fn auto_release(&self, now: DateTime<Utc>) -> EscrowResult<usize> {
        let system = ActorContext::system();
        let mut released = 0;
        for escrow in self.escrows.list_escrows(Some(EscrowStatus::Funded)).await? {
            if !timelock::can_auto_release_at(&escrow, now) {
                continue;
            }
            match self.release(escrow.id, &system).await {
                Ok(_) => {
                    tracing::info!(escrow_id = %escrow.id, "Time-locked escrow auto-released");
                    released += 1;
                }
                Err(EscrowError::ConcurrencyConflict(_)) => {
                    tracing::debug!(escrow_id = %escrow.id, "Auto-release skipped, payout already active");
                }
                Err(e) => {
                    tracing::warn!(escrow_id = %escrow.id, error = %e, "Auto-release failed");
                }
            }
        }
        Ok(released)
    }

    /// Bring the escrow in line with a payout row that already completed.
    ///
    /// Returns `true` when a status actually changed.
    pub async fn finalize_payout(&self, row: &RetryableTransaction) -> EscrowResult<bool> {
        if row.status != PayoutStatus::Completed {
            return Ok(false);
        }
        let Some(tx_hash) = row.tx_hash else {
            return Ok(false);
        };
        let receipt = PayoutReceipt {
            payout_id: row.id,
            tx_hash,
            sent_wei: row.sent_wei.unwrap_or_default(),
            attempts: row.attempts,
        };

        match row.kind {
            PayoutKind::Release => {
                let escrow = self.escrows.get_escrow(row.escrow_id).await?;
                if escrow.status.is_terminal() {
                    return Ok(false);
                }
                self.finalize_release(row.escrow_id, &receipt).await?;
            }
            PayoutKind::Refund => {
                let escrow = self.escrows.get_escrow(row.escrow_id).await?;
                if escrow.status.is_terminal() {
                    return Ok(false);
                }
                self.finalize_refund(row.escrow_id, &receipt).await?;
            }
            PayoutKind::Milestone => {
                let Some(milestone_id) = row.milestone_id else {
                    return Ok(false);
                };
                let milestone = self.escrows.get_milestone(milestone_id).await?;
                if milestone.status == MilestoneStatus::Released {
                    return Ok(false);
                }
                self.finalize_milestone(milestone_id, tx_hash).await?;
            }
        }
        tracing::info!(payout_id = %row.id, escrow_id = %row.escrow_id, kind = %row.kind, "Finalized recovered payout");
        Ok(true)
    }

    async fn finalize_release(&self, escrow_id: Uuid, receipt: &PayoutReceipt) -> EscrowResult<EscrowView> {
        let escrow = self
            .settle(escrow_id, EscrowStatus::Released, |e, now| {
                e.released_at = Some(now);
            })
            .await?;
        self.emit(
            WebhookEvent::FundsReleased,
            &escrow,
            serde_json::json!({
                "tx_hash": receipt.tx_hash,
                "amount": escrow.amount.value.to_string(),
                "sent_wei": receipt.sent_wei.to_string(),
                "recipient": escrow.seller,
            }),
        );
        tracing::info!(escrow_id = %escrow.id, tx_hash = %receipt.tx_hash, "Escrow released");
        Ok(EscrowView::from(&escrow))
    }

    async fn finalize_refund(&self, escrow_id: Uuid, receipt: &PayoutReceipt) -> EscrowResult<EscrowView> {
        let escrow = self
            .settle(escrow_id, EscrowStatus::Cancelled, |e, now| {
                e.cancelled_at = Some(now);
            })
            .await?;
        self.audit.append(
            AuditEntry::new(
                escrow.id,
                AuditAction::EscrowCancelled { refunded: true },
                Actor::System.to_string(),
            )
            .custody(escrow.custody_address)
            .tx_hash(receipt.tx_hash.to_string()),
        );
        self.emit(
            WebhookEvent::FundsRefunded,
            &escrow,
            serde_json::json!({
                "tx_hash": receipt.tx_hash,
                "amount": escrow.amount.value.to_string(),
                "sent_wei": receipt.sent_wei.to_string(),
                "recipient": escrow.buyer,
            }),
        );
        tracing::info!(escrow_id = %escrow.id, tx_hash = %receipt.tx_hash, "Escrow refunded and cancelled");
        Ok(EscrowView::from(&escrow))
    }

    /// Mark the milestone released; cascade the escrow once every milestone is.
    async fn finalize_milestone(&self, milestone_id: Uuid, tx_hash: TxHash) -> EscrowResult<(Milestone, EscrowView)> {
        let mut milestone = self.escrows.get_milestone(milestone_id).await?;
        for _ in 0..FINALIZE_RETRIES {
            if milestone.status == MilestoneStatus::Released {
                break;
            }
            let expected = milestone.status;
            let mut updated = milestone.clone();
            updated.status = MilestoneStatus::Released;
            updated.released_at = Some(Utc::now());
            match self
                .escrows
                .compare_and_set_milestone(updated.clone(), expected)
                .await
            {
                Ok(()) => {
                    milestone = updated;
                    break;
                }
                Err(StoreError::Conflict(_)) => {
                    milestone = self.escrows.get_milestone(milestone_id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if milestone.status != MilestoneStatus::Released {
            return Err(EscrowError::conflict(format!(
                "milestone {} kept changing while finalizing",
                milestone_id
            )));
        }

        let escrow = self.escrows.get_escrow(milestone.escrow_id).await?;
        self.emit(
            WebhookEvent::MilestoneReleased,
            &escrow,
            serde_json::json!({
                "milestone_id": milestone.id,
                "amount": milestone.amount.to_string(),
                "tx_hash": tx_hash,
            }),
        );

        let milestones = self.escrows.list_milestones(escrow.id).await?;
        let all_released = milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Released);
        tracing::info!(
            escrow_id = %escrow.id,
            milestone_id = %milestone.id,
            tx_hash = %tx_hash,
            all_released,
            "Milestone released"
        );

        let escrow = if all_released && !escrow.status.is_terminal() {
            let released = self
                .settle(escrow.id, EscrowStatus::Released, |e, now| {
                    e.released_at = Some(now);
                })
                .await?;
            tracing::info!(escrow_id = %released.id, "All milestones released, escrow released");
            released
        } else {
            escrow
        };
        Ok((milestone, EscrowView::from(&escrow)))
    }

    /// Move the escrow to a terminal status after a completed payout.
    ///
    /// Funds have moved, so any non-terminal status is overwritten.
    async fn settle<F>(&self, escrow_id: Uuid, target: EscrowStatus, stamp: F) -> EscrowResult<Escrow>
    where
        F: Fn(&mut Escrow, DateTime<Utc>),
    {
        for _ in 0..FINALIZE_RETRIES {
            let current = self.escrows.get_escrow(escrow_id).await?;
            if current.status == target {
                return Ok(current);
            }
            if current.status.is_terminal() {
                return Err(EscrowError::conflict(format!(
                    "payout completed but escrow {} is already {}",
                    escrow_id, current.status
                )));
            }
            if current.status != EscrowStatus::Funded {
                tracing::warn!(escrow_id = %escrow_id, status = %current.status, target = %target, "Settling escrow from unexpected status");
            }

            let expected = current.status;
            let mut updated = current;
            let now = Utc::now();
            updated.status = target;
            updated.updated_at = now;
            stamp(&mut updated, now);
            match self
                .escrows
                .compare_and_set_escrow(updated.clone(), expected)
                .await
            {
                Ok(()) => {
                    metrics::record_transition(target.as_str());
                    return Ok(updated);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EscrowError::conflict(format!(
            "escrow {} kept changing while settling",
            escrow_id
        )))
    }

    fn validate_amount(&self, amount: Decimal, field: &str) -> EscrowResult<()> {
        if amount <= Decimal::ZERO {
            return Err(EscrowError::validation(format!("{} must be greater than zero", field)));
        }
        to_base_units(amount, self.settings.currency_decimals).map_err(|_| {
            EscrowError::validation(format!(
                "{} {} exceeds {} decimal places",
                field, amount, self.settings.currency_decimals
            ))
        })?;
        Ok(())
    }

    fn emit(&self, event: WebhookEvent, escrow: &Escrow, data: serde_json::Value) {
        self.webhooks.notify(WebhookPayload::new(
            event,
            escrow.id,
            escrow.custody_address,
            data,
        ));
    }
}

fn require_status(escrow: &Escrow, expected: EscrowStatus) -> EscrowResult<()> {
    if escrow.status == expected {
        Ok(())
    } else {
        Err(EscrowError::validation(format!(
            "escrow is {}, expected {}",
            escrow.status, expected
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_is_one_cent() {
        assert_eq!(MILESTONE_SUM_TOLERANCE.to_string(), "0.01");
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = ServiceConfig::default();
        config.sweeps.funding_timeout_hours = 48;
        config.blockchain.chain_id = 11155111;
        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.chain_id, 11155111);
        assert_eq!(settings.funding_timeout, Some(ChronoDuration::hours(48)));

        config.sweeps.funding_timeout_hours = 0;
        assert_eq!(EngineSettings::from_config(&config).funding_timeout, None);
    }
}
