//! Transaction dispatcher: durable, retried payouts.
//!
//! # Responsibilities
//! - Claim the payout key with a conditional insert before any broadcast
//! - Decrypt the custody key, sign once and submit through [`ChainRpc`]
//! - Retry transient failures with exponential backoff and jitter
//! - Record every status change on the retry row
//! - Audit the outcome (success with `retry_successful`, or failure)
//!
//! # Row lifecycle
//! ```text
//! insert (pending) ──CAS──▶ processing ──▶ completed
//!        ▲                      │
//!        └── transient, attempts left (sleep backoff)
//!                               └──▶ failed (permanent / exhausted)
//! ```
//!
//! # Design Decisions
//! - Exclusivity lives in the store, never in process-local locks
//! - The first attempt signs and pins the transfer on the row before sending.
//!   Retries and recovery resubmit those bytes, checking for a receipt first,
//!   so a lost response cannot turn into a second transfer
//! - The plaintext key lives only inside [`TransactionDispatcher::sign_and_pin`]

use alloy::primitives::{TxHash, U256};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::{AuditAction, AuditEntry, AuditLog, PayoutOutcome};
use crate::blockchain::client::ChainRpc;
use crate::blockchain::transaction::wait_for_confirmation;
use crate::blockchain::types::{ConfirmationStatus, SignedTransfer};
use crate::blockchain::wallet::signer_from_key;
use crate::custody::KeyVault;
use crate::error::{EscrowError, EscrowResult};
use crate::observability::metrics;
use crate::payments::types::{
    PayoutAmount, PayoutKind, PayoutReceipt, PayoutRequest, PayoutStatus, RetryableTransaction,
};
use crate::resilience::RetryPolicy;
use crate::store::{EscrowStore, PayoutStore, StoreError};

const CONFIRMATION_POLL: Duration = Duration::from_secs(2);
const CONFIRMATION_MAX_WAIT: Duration = Duration::from_secs(600);

/// Executes payouts on behalf of the lifecycle engine.
pub struct TransactionDispatcher {
    payouts: Arc<dyn PayoutStore>,
    escrows: Arc<dyn EscrowStore>,
    vault: Arc<KeyVault>,
    rpc: Arc<dyn ChainRpc>,
    audit: AuditLog,
    policy: RetryPolicy,
    confirmation_blocks: u64,
}

impl TransactionDispatcher {
    pub fn new(
        payouts: Arc<dyn PayoutStore>,
        escrows: Arc<dyn EscrowStore>,
        vault: Arc<KeyVault>,
        rpc: Arc<dyn ChainRpc>,
        audit: AuditLog,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            payouts,
            escrows,
            vault,
            rpc,
            audit,
            policy,
            confirmation_blocks: 0,
        }
    }

    /// Track confirmations of completed payouts up to `blocks` deep (0 disables).
    pub fn with_confirmation_tracking(mut self, blocks: u64) -> Self {
        self.confirmation_blocks = blocks;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn payouts(&self) -> &Arc<dyn PayoutStore> {
        &self.payouts
    }

    /// Create the retry row and run it to completion.
    ///
    /// Fails with `ConcurrencyConflict`, and without side effects, when
    /// another payout for the same key is pending, processing or completed.
    pub async fn submit(&self, request: PayoutRequest) -> EscrowResult<PayoutReceipt> {
        let row = RetryableTransaction::new(request, self.policy.max_attempts);
        let id = row.id;

        self.payouts
            .insert_payout_if_absent(row)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(msg) => EscrowError::ConcurrencyConflict(msg),
                other => other.into(),
            })?;

        tracing::info!(payout_id = %id, "Payout queued");
        self.run(id).await
    }

    /// Continue a `pending` row, as the recovery sweep does after a restart.
    pub async fn resume(&self, payout_id: uuid::Uuid) -> EscrowResult<PayoutReceipt> {
        self.run(payout_id).await
    }

    /// Reset rows stuck in `processing` since before `cutoff` back to `pending`.
    pub async fn reset_stuck(&self, cutoff: chrono::DateTime<chrono::Utc>) -> EscrowResult<usize> {
        let mut reset = 0;
        for row in self.payouts.list_payouts(Some(PayoutStatus::Processing)).await? {
            if row.updated_at >= cutoff {
                continue;
            }
            let result = self
                .payouts
                .transition_payout(
                    row.id,
                    PayoutStatus::Processing,
                    Box::new(|r| {
                        r.status = PayoutStatus::Pending;
                        r.last_error = Some("processing timeout".to_string());
                    }),
                )
                .await;
            match result {
                Ok(_) => {
                    tracing::warn!(payout_id = %row.id, escrow_id = %row.escrow_id, "Reset stuck payout");
                    reset += 1;
                }
                // Settled while we were looking.
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(reset)
    }

    /// Operator stop: fail a row that is waiting between attempts.
    pub async fn mark_failed(&self, payout_id: uuid::Uuid, reason: &str) -> EscrowResult<RetryableTransaction> {
        let reason = reason.to_string();
        let row = self
            .payouts
            .transition_payout(
                payout_id,
                PayoutStatus::Pending,
                Box::new(move |r| {
                    r.status = PayoutStatus::Failed;
                    r.last_error = Some(format!("stopped by operator: {}", reason));
                }),
            )
            .await?;

        self.audit_failure(&row);
        tracing::warn!(payout_id = %payout_id, escrow_id = %row.escrow_id, "Payout stopped by operator");
        Ok(row)
    }

    async fn run(&self, payout_id: uuid::Uuid) -> EscrowResult<PayoutReceipt> {
        let started = Instant::now();

        loop {
            let row = self
                .payouts
                .transition_payout(
                    payout_id,
                    PayoutStatus::Pending,
                    Box::new(|r| {
                        r.status = PayoutStatus::Processing;
                        r.attempts += 1;
                    }),
                )
                .await;
            let row = match row {
                Ok(row) => row,
                Err(StoreError::Conflict(msg)) => return Err(self.claim_lost(payout_id, msg).await),
                Err(e) => return Err(e.into()),
            };
            let kind = row.kind.as_str();

            tracing::info!(
                payout_id = %row.id,
                escrow_id = %row.escrow_id,
                kind,
                attempt = row.attempts,
                max_attempts = row.max_attempts,
                "Broadcasting payout"
            );

            match self.attempt(&row).await {
                Ok(transfer) => {
                    metrics::record_payout_attempt(kind, "success");
                    metrics::record_payout_duration(kind, started);
                    return self.complete(row, transfer.tx_hash, transfer.value).await;
                }
                Err(e) if e.is_transient() && row.attempts_left() => {
                    metrics::record_payout_attempt(kind, "retry");
                    let message = e.to_string();
                    self.payouts
                        .transition_payout(
                            payout_id,
                            PayoutStatus::Processing,
                            Box::new(move |r| {
                                r.status = PayoutStatus::Pending;
                                r.last_error = Some(message);
                            }),
                        )
                        .await?;

                    let delay = self.policy.delay_after(row.attempts - 1);
                    tracing::warn!(
                        payout_id = %row.id,
                        escrow_id = %row.escrow_id,
                        attempt = row.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Payout attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::record_payout_attempt(kind, "failure");
                    let message = e.to_string();
                    let failed = self
                        .payouts
                        .transition_payout(
                            payout_id,
                            PayoutStatus::Processing,
                            Box::new(move |r| {
                                r.status = PayoutStatus::Failed;
                                r.last_error = Some(message);
                            }),
                        )
                        .await?;

                    tracing::error!(
                        payout_id = %failed.id,
                        escrow_id = %failed.escrow_id,
                        attempts = failed.attempts,
                        pinned_tx = ?failed.transfer.as_ref().map(|t| t.tx_hash),
                        error = %e,
                        "Payout failed"
                    );
                    self.audit_failure(&failed);
                    return Err(e);
                }
            }
        }
    }

    /// Explain why the pending → processing claim failed.
    ///
    /// An operator stop between attempts leaves the row `failed`; that is the
    /// payout's outcome, not a competing payout.
    async fn claim_lost(&self, payout_id: uuid::Uuid, conflict: String) -> EscrowError {
        match self.payouts.get_payout(payout_id).await {
            Ok(row) if row.status == PayoutStatus::Failed => {
                tracing::warn!(payout_id = %payout_id, escrow_id = %row.escrow_id, "Payout was stopped between attempts");
                EscrowError::RpcPermanent(
                    row.last_error
                        .unwrap_or_else(|| format!("payout {} failed", payout_id)),
                )
            }
            Ok(_) => EscrowError::ConcurrencyConflict(conflict),
            Err(e) => e.into(),
        }
    }

    /// One attempt: sign on the first, resubmit the pinned bytes after that.
    async fn attempt(&self, row: &RetryableTransaction) -> EscrowResult<SignedTransfer> {
        let transfer = match &row.transfer {
            Some(pinned) => {
                if self.landed(pinned).await {
                    tracing::info!(payout_id = %row.id, tx_hash = %pinned.tx_hash, "Pinned transfer already mined");
                    return Ok(pinned.clone());
                }
                pinned.clone()
            }
            None => self.sign_and_pin(row).await?,
        };

        match self.rpc.send_transfer(&transfer).await {
            Ok(_) => Ok(transfer),
            Err(e) => {
                // A resubmission can be rejected because the first copy got in.
                if row.transfer.is_some() && self.landed(&transfer).await {
                    tracing::info!(payout_id = %row.id, tx_hash = %transfer.tx_hash, error = %e, "Resubmission rejected but transfer is mined");
                    return Ok(transfer);
                }
                Err(e.into())
            }
        }
    }

    async fn landed(&self, transfer: &SignedTransfer) -> bool {
        matches!(self.rpc.get_confirmations(transfer.tx_hash).await, Ok(Some(_)))
    }

    /// Decrypt, size and sign the transfer, then persist it on the row.
    /// The decrypted key does not outlive this call.
    async fn sign_and_pin(&self, row: &RetryableTransaction) -> EscrowResult<SignedTransfer> {
        let escrow = self.escrows.get_escrow(row.escrow_id).await?;

        let signer = {
            let key = self.vault.decrypt(&escrow.encrypted_key)?;
            signer_from_key(&key)?
        };
        self.audit.append(
            AuditEntry::new(
                row.escrow_id,
                AuditAction::KeyDecrypted {
                    payout_id: row.id,
                    purpose: row.kind,
                },
                row.actor.clone(),
            )
            .custody(escrow.custody_address),
        );

        let balance = self.rpc.get_balance(escrow.custody_address).await?;
        let fee = self.rpc.estimate_transfer_fee().await?;
        let value = match row.amount {
            PayoutAmount::FullBalance => {
                if balance <= fee {
                    return Err(EscrowError::RpcPermanent(format!(
                        "custody balance {} wei cannot cover network fee {} wei",
                        balance, fee
                    )));
                }
                balance - fee
            }
            PayoutAmount::Exact { wei } => {
                if balance < wei.saturating_add(fee) {
                    return Err(EscrowError::RpcPermanent(format!(
                        "custody balance {} wei cannot cover {} wei plus fee {} wei",
                        balance, wei, fee
                    )));
                }
                wei
            }
        };

        let transfer = self
            .rpc
            .sign_transfer(&signer, row.recipient, value, row.chain_id)
            .await?;

        // Nothing is sent until the bytes are durable.
        let pinned = transfer.clone();
        self.payouts
            .transition_payout(
                row.id,
                PayoutStatus::Processing,
                Box::new(move |r| r.transfer = Some(pinned)),
            )
            .await?;
        tracing::debug!(payout_id = %row.id, tx_hash = %transfer.tx_hash, nonce = transfer.nonce, "Pinned signed transfer");
        Ok(transfer)
    }

    async fn complete(
        &self,
        row: RetryableTransaction,
        tx_hash: TxHash,
        sent_wei: U256,
    ) -> EscrowResult<PayoutReceipt> {
        let completed = self
            .payouts
            .transition_payout(
                row.id,
                PayoutStatus::Processing,
                Box::new(move |r| {
                    r.status = PayoutStatus::Completed;
                    r.tx_hash = Some(tx_hash);
                    r.sent_wei = Some(sent_wei);
                    r.last_error = None;
                }),
            )
            .await?;

        tracing::info!(
            payout_id = %completed.id,
            escrow_id = %completed.escrow_id,
            tx_hash = %tx_hash,
            attempts = completed.attempts,
            "Payout completed"
        );

        let outcome = PayoutOutcome {
            payout_id: completed.id,
            attempts: completed.attempts,
            retry_successful: true,
            sent_wei: sent_wei.to_string(),
        };
        let action = match completed.kind {
            PayoutKind::Release => AuditAction::FundsReleased(outcome),
            PayoutKind::Refund => AuditAction::FundsRefunded(outcome),
            PayoutKind::Milestone => AuditAction::MilestoneReleased {
                milestone_id: completed.milestone_id.unwrap_or_default(),
                outcome,
            },
        };
        let custody = self
            .escrows
            .get_escrow(completed.escrow_id)
            .await
            .map(|e| e.custody_address)
            .ok();
        let mut entry = AuditEntry::new(completed.escrow_id, action, completed.actor.clone())
            .amount(completed.nominal_amount)
            .tx_hash(tx_hash.to_string())
            .meta("recipient", completed.recipient.to_string());
        if let Some(address) = custody {
            entry = entry.custody(address);
        }
        self.audit.append(entry);

        self.track_confirmations(completed.id, tx_hash);

        Ok(PayoutReceipt {
            payout_id: completed.id,
            tx_hash,
            sent_wei,
            attempts: completed.attempts,
        })
    }

    fn audit_failure(&self, row: &RetryableTransaction) {
        self.audit.append(
            AuditEntry::new(
                row.escrow_id,
                AuditAction::PayoutFailed {
                    payout_id: row.id,
                    kind: row.kind,
                    attempts: row.attempts,
                    error: row.last_error.clone().unwrap_or_default(),
                },
                row.actor.clone(),
            )
            .amount(row.nominal_amount),
        );
    }

    fn track_confirmations(&self, payout_id: uuid::Uuid, tx_hash: TxHash) {
        if self.confirmation_blocks == 0 {
            return;
        }
        let rpc = self.rpc.clone();
        let payouts = self.payouts.clone();
        let required = self.confirmation_blocks;

        tokio::spawn(async move {
            match wait_for_confirmation(
                rpc.as_ref(),
                tx_hash,
                required,
                CONFIRMATION_POLL,
                CONFIRMATION_MAX_WAIT,
            )
            .await
            {
                Ok(ConfirmationStatus::Confirmed { confirmations }) => {
                    if let Err(e) = payouts.record_confirmations(payout_id, confirmations).await {
                        tracing::warn!(payout_id = %payout_id, error = %e, "Failed to record confirmations");
                    }
                    tracing::info!(payout_id = %payout_id, tx_hash = %tx_hash, confirmations, "Payout confirmed");
                }
                Ok(ConfirmationStatus::Failed(reason)) => {
                    tracing::error!(payout_id = %payout_id, tx_hash = %tx_hash, reason = %reason, "Payout transaction failed on chain");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(payout_id = %payout_id, tx_hash = %tx_hash, error = %e, "Stopped tracking payout confirmations");
                }
            }
        });
    }
}
