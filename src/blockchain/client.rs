//! Blockchain RPC client with failover, timeouts and error classification.
//!
//! # Responsibilities
//! - Define the minimal chain surface the custody core needs ([`ChainRpc`])
//! - Query balances, gas prices, nonces and receipts
//! - Build and sign native-currency transfers; submit signed bytes
//! - Classify node errors as transient or permanent
//! - Provide health check for blockchain connectivity
//!
//! # Design Decisions
//! - Every call carries a timeout; reads use `rpc_timeout_secs`, submission
//!   uses `broadcast_timeout_ms`
//! - Signing and submission are separate calls so a payout can persist the
//!   signed bytes first and resubmit exactly those after a lost response
//! - Transport failures fall through to the next provider, node rejections do not
//! - Legacy gas pricing: the transfer shape never needs more

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::blockchain::types::{
    BlockchainConfig, BlockchainError, BlockchainResult, ChainId, SignedTransfer,
};
use crate::observability::metrics;

/// Gas used by a plain value transfer.
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;

const WEI_PER_GWEI: u128 = 1_000_000_000;

/// Minimal chain RPC surface used by the custody core.
///
/// Implemented over alloy for production and by scripted mocks in tests.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Native balance of `address` in base units.
    async fn get_balance(&self, address: Address) -> BlockchainResult<U256>;

    /// Network fee of a single value transfer at the current gas price.
    async fn estimate_transfer_fee(&self) -> BlockchainResult<U256>;

    /// Sign a value transfer at the sender's next nonce. Sends nothing.
    async fn sign_transfer(
        &self,
        signer: &PrivateKeySigner,
        to: Address,
        value: U256,
        chain_id: u64,
    ) -> BlockchainResult<SignedTransfer>;

    /// Submit a signed transfer, returning its hash.
    ///
    /// Resubmitting bytes the node already holds succeeds with the same hash.
    async fn send_transfer(&self, transfer: &SignedTransfer) -> BlockchainResult<TxHash>;

    /// Confirmation depth of a transaction, `None` while it is not mined.
    async fn get_confirmations(&self, tx_hash: TxHash) -> BlockchainResult<Option<u64>>;

    /// Whether the node answers at all.
    async fn is_healthy(&self) -> bool;
}

/// Map a transport error onto the retry taxonomy.
///
/// A JSON-RPC error response means the node understood and refused the
/// request (bad address, insufficient funds, nonce too low, revert), so it is
/// permanent. Everything else is a transport problem and may be retried.
pub fn classify_rpc_error(err: TransportError) -> BlockchainError {
    match err {
        RpcError::ErrorResp(payload) => BlockchainError::Permanent(payload.to_string()),
        other => BlockchainError::Transient(other.to_string()),
    }
}

/// Node responses meaning "this exact transaction is already in the pool".
pub fn is_already_known(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["already known", "known transaction", "already imported"]
        .iter()
        .any(|needle| message.contains(needle))
}

type SharedProvider = Arc<dyn Provider + Send + Sync>;

/// Alloy-backed [`ChainRpc`] with failover support.
#[derive(Clone)]
pub struct AlloyRpcClient {
    /// List of providers (primary + failovers).
    providers: Vec<SharedProvider>,
    config: BlockchainConfig,
    timeout_duration: Duration,
    broadcast_timeout: Duration,
}

impl AlloyRpcClient {
    /// Create a new client.
    ///
    /// Connection problems are not fatal here; the chain may come up later.
    pub async fn new(config: BlockchainConfig) -> BlockchainResult<Self> {
        let mut providers = Vec::new();

        let primary_url: url::Url = config.rpc_url.parse().map_err(|e| {
            BlockchainError::Permanent(format!("Invalid RPC URL '{}': {}", config.rpc_url, e))
        })?;
        providers.push(Arc::new(ProviderBuilder::new().connect_http(primary_url)) as SharedProvider);

        for url_str in &config.failover_urls {
            match url_str.parse::<url::Url>() {
                Ok(url) => {
                    providers.push(Arc::new(ProviderBuilder::new().connect_http(url)) as SharedProvider)
                }
                Err(_) => tracing::warn!(url = %url_str, "Ignoring invalid failover RPC URL"),
            }
        }

        let client = Self {
            providers,
            timeout_duration: Duration::from_secs(config.rpc_timeout_secs),
            broadcast_timeout: Duration::from_millis(config.broadcast_timeout_ms),
            config,
        };

        match client.verify_chain_id().await {
            Ok(()) => tracing::info!(
                rpc_url = %client.config.rpc_url,
                chain_id = client.config.chain_id,
                failovers = client.providers.len() - 1,
                "Blockchain client initialized"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                "Blockchain client initialized but chain verification failed"
            ),
        }

        Ok(client)
    }

    /// Run `op` against each provider in turn until one answers.
    ///
    /// Node rejections are returned immediately; only transport errors and
    /// timeouts move on to the next provider.
    async fn with_failover<T, F, Fut>(&self, op: &'static str, f: F) -> BlockchainResult<T>
    where
        F: Fn(SharedProvider) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut last_error = BlockchainError::Transient(format!("{}: no RPC providers", op));

        for (i, provider) in self.providers.iter().enumerate() {
            match timeout(self.timeout_duration, f(provider.clone())).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    let classified = classify_rpc_error(e);
                    if !classified.is_transient() {
                        return Err(classified);
                    }
                    tracing::warn!(provider_idx = i, op, error = %classified, "RPC error, trying next provider");
                    last_error = classified;
                }
                Err(_) => {
                    tracing::warn!(provider_idx = i, op, "RPC timeout, trying next provider");
                    last_error = BlockchainError::Timeout(self.timeout_duration.as_millis() as u64);
                }
            }
        }

        Err(last_error)
    }

    /// Verify the connected chain ID matches configuration.
    pub async fn verify_chain_id(&self) -> BlockchainResult<()> {
        let chain_id = self.get_chain_id().await?;
        if chain_id.0 != self.config.chain_id {
            return Err(BlockchainError::ChainMismatch {
                expected: self.config.chain_id,
                actual: chain_id.0,
            });
        }
        Ok(())
    }

    pub async fn get_chain_id(&self) -> BlockchainResult<ChainId> {
        self.with_failover("get_chain_id", |p| async move { p.get_chain_id().await })
            .await
            .map(ChainId)
    }

    pub async fn get_block_number(&self) -> BlockchainResult<u64> {
        self.with_failover("get_block_number", |p| async move { p.get_block_number().await })
            .await
    }

    /// Node gas price with the configured multiplier, capped at `max_gas_price_gwei`.
    pub async fn gas_price(&self) -> BlockchainResult<u128> {
        let node_price = self
            .with_failover("get_gas_price", |p| async move { p.get_gas_price().await })
            .await?;
        adjust_gas_price(
            node_price,
            self.config.gas_price_multiplier,
            self.config.max_gas_price_gwei,
        )
    }

    async fn pending_nonce(&self, address: Address) -> BlockchainResult<u64> {
        self.with_failover("get_transaction_count", |p| async move {
            p.get_transaction_count(address).pending().await
        })
        .await
    }

    async fn sign(
        &self,
        signer: &PrivateKeySigner,
        to: Address,
        value: U256,
        chain_id: u64,
    ) -> BlockchainResult<SignedTransfer> {
        if chain_id != self.config.chain_id {
            return Err(BlockchainError::ChainMismatch {
                expected: self.config.chain_id,
                actual: chain_id,
            });
        }

        let nonce = self.pending_nonce(signer.address()).await?;
        let gas_price = self.gas_price().await?;

        let tx = TransactionRequest::default()
            .with_to(to)
            .with_value(value)
            .with_nonce(nonce)
            .with_gas_price(gas_price)
            .with_gas_limit(TRANSFER_GAS_LIMIT)
            .with_chain_id(chain_id);

        let wallet = EthereumWallet::from(signer.clone());
        let envelope = tx
            .build(&wallet)
            .await
            .map_err(|e| BlockchainError::Wallet(format!("Signing failed: {}", e)))?;

        Ok(SignedTransfer {
            tx_hash: *envelope.tx_hash(),
            nonce,
            value,
            raw: Bytes::from(envelope.encoded_2718()),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &BlockchainConfig {
        &self.config
    }
}

/// Apply the safety multiplier to a node gas price and enforce the cap.
pub fn adjust_gas_price(node_price: u128, multiplier: f64, max_gwei: u64) -> BlockchainResult<u128> {
    let max_price = max_gwei as u128 * WEI_PER_GWEI;
    if node_price > max_price {
        return Err(BlockchainError::GasPriceTooHigh {
            current_gwei: (node_price / WEI_PER_GWEI) as u64,
            max_gwei,
        });
    }
    let adjusted = (node_price as f64 * multiplier) as u128;
    Ok(adjusted.min(max_price))
}

#[async_trait]
impl ChainRpc for AlloyRpcClient {
    async fn get_balance(&self, address: Address) -> BlockchainResult<U256> {
        self.with_failover("get_balance", |p| async move { p.get_balance(address).await })
            .await
    }

    async fn estimate_transfer_fee(&self) -> BlockchainResult<U256> {
        let gas_price = self.gas_price().await?;
        Ok(U256::from(gas_price) * U256::from(TRANSFER_GAS_LIMIT))
    }

    async fn sign_transfer(
        &self,
        signer: &PrivateKeySigner,
        to: Address,
        value: U256,
        chain_id: u64,
    ) -> BlockchainResult<SignedTransfer> {
        self.sign(signer, to, value, chain_id).await
    }

    async fn send_transfer(&self, transfer: &SignedTransfer) -> BlockchainResult<TxHash> {
        let raw = transfer.raw.clone();
        let sent = timeout(
            self.broadcast_timeout,
            self.with_failover("send_raw_transaction", |p| {
                let raw = raw.clone();
                async move {
                    let pending = p.send_raw_transaction(&raw).await?;
                    Ok(*pending.tx_hash())
                }
            }),
        )
        .await;

        match sent {
            Ok(Ok(hash)) => Ok(hash),
            Ok(Err(BlockchainError::Permanent(msg))) if is_already_known(&msg) => {
                tracing::debug!(tx_hash = %transfer.tx_hash, "Node already holds transfer");
                Ok(transfer.tx_hash)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BlockchainError::Timeout(
                self.broadcast_timeout.as_millis() as u64,
            )),
        }
    }

    async fn get_confirmations(&self, tx_hash: TxHash) -> BlockchainResult<Option<u64>> {
        let receipt = self
            .with_failover("get_transaction_receipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        if !receipt.status() {
            return Err(BlockchainError::Permanent(format!(
                "transaction {} reverted",
                tx_hash
            )));
        }

        let current_block = self.get_block_number().await?;
        let tx_block = receipt.block_number.unwrap_or(current_block);
        Ok(Some(current_block.saturating_sub(tx_block) + 1))
    }

    async fn is_healthy(&self) -> bool {
        let healthy = self.get_block_number().await.is_ok();
        metrics::record_rpc_health(healthy);
        healthy
    }
}

impl std::fmt::Debug for AlloyRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlloyRpcClient")
            .field("rpc_url", &self.config.rpc_url)
            .field("chain_id", &self.config.chain_id)
            .field("providers", &self.providers.len())
            .finish()
    }
}
