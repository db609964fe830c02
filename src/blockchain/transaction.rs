//! Confirmation monitoring for broadcast payouts.
//!
//! # Responsibilities
//! - Poll a transaction until it reaches the configured depth
//! - Surface reverts as `Failed`
//! - Bound the wait with a timeout

use alloy::primitives::TxHash;
use std::time::Duration;
use tokio::time::{interval, timeout};

use crate::blockchain::client::ChainRpc;
use crate::blockchain::types::{BlockchainError, BlockchainResult, ConfirmationStatus};

/// Check a transaction once.
pub async fn check_confirmation(
    rpc: &dyn ChainRpc,
    tx_hash: TxHash,
    required: u64,
) -> BlockchainResult<ConfirmationStatus> {
    match rpc.get_confirmations(tx_hash).await {
        Ok(None) => Ok(ConfirmationStatus::Pending),
        Ok(Some(confirmations)) if confirmations >= required => {
            Ok(ConfirmationStatus::Confirmed { confirmations })
        }
        Ok(Some(current)) => Ok(ConfirmationStatus::Confirming { current, required }),
        Err(BlockchainError::Permanent(reason)) => Ok(ConfirmationStatus::Failed(reason)),
        Err(e) => Err(e),
    }
}

/// Wait for a transaction to be confirmed.
///
/// Transient RPC errors while polling are logged and the poll continues;
/// the overall wait is bounded by `max_wait`.
pub async fn wait_for_confirmation(
    rpc: &dyn ChainRpc,
    tx_hash: TxHash,
    required: u64,
    poll_interval: Duration,
    max_wait: Duration,
) -> BlockchainResult<ConfirmationStatus> {
    let result = timeout(max_wait, async {
        let mut ticker = interval(poll_interval);

        loop {
            ticker.tick().await;

            match check_confirmation(rpc, tx_hash, required).await {
                Ok(status @ ConfirmationStatus::Confirmed { .. })
                | Ok(status @ ConfirmationStatus::Failed(_)) => return status,
                Ok(ConfirmationStatus::Confirming { current, required }) => {
                    tracing::debug!(
                        tx_hash = %tx_hash,
                        confirmations = current,
                        required = required,
                        "Waiting for confirmations"
                    );
                }
                Ok(ConfirmationStatus::Pending) => {
                    tracing::debug!(tx_hash = %tx_hash, "Transaction pending");
                }
                Err(e) => {
                    tracing::warn!(tx_hash = %tx_hash, error = %e, "Confirmation poll failed");
                }
            }
        }
    })
    .await;

    result.map_err(|_| BlockchainError::Timeout(max_wait.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, U256};
    use alloy::signers::local::PrivateKeySigner;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use crate::blockchain::types::SignedTransfer;

    /// Gains one confirmation per poll after the first.
    struct SlowChain {
        polls: AtomicU64,
        reverted: bool,
    }

    #[async_trait]
    impl ChainRpc for SlowChain {
        async fn get_balance(&self, _address: Address) -> BlockchainResult<U256> {
            Ok(U256::ZERO)
        }

        async fn estimate_transfer_fee(&self) -> BlockchainResult<U256> {
            Ok(U256::ZERO)
        }

        async fn sign_transfer(
            &self,
            _signer: &PrivateKeySigner,
            _to: Address,
            value: U256,
            _chain_id: u64,
        ) -> BlockchainResult<SignedTransfer> {
            Ok(SignedTransfer {
                tx_hash: TxHash::ZERO,
                nonce: 0,
                value,
                raw: Default::default(),
            })
        }

        async fn send_transfer(&self, transfer: &SignedTransfer) -> BlockchainResult<TxHash> {
            Ok(transfer.tx_hash)
        }

        async fn get_confirmations(&self, _tx_hash: TxHash) -> BlockchainResult<Option<u64>> {
            if self.reverted {
                return Err(BlockchainError::Permanent("reverted".into()));
            }
            let polls = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(if polls == 0 { None } else { Some(polls) })
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_waits_until_required_depth() {
        let chain = SlowChain { polls: AtomicU64::new(0), reverted: false };
        let status = wait_for_confirmation(
            &chain,
            TxHash::ZERO,
            3,
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(status, ConfirmationStatus::Confirmed { confirmations: 3 });
        assert_eq!(chain.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_revert_is_failed_status() {
        let chain = SlowChain { polls: AtomicU64::new(0), reverted: true };
        let status = check_confirmation(&chain, TxHash::ZERO, 1).await.unwrap();
        assert!(matches!(status, ConfirmationStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_times_out() {
        let chain = SlowChain { polls: AtomicU64::new(0), reverted: false };
        let err = wait_for_confirmation(
            &chain,
            TxHash::ZERO,
            1_000,
            Duration::from_millis(1),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BlockchainError::Timeout(20)));
    }
}
