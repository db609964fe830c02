//! Shared utilities for integration tests: a scripted chain and an engine harness.
#![allow(dead_code)]

use alloy::primitives::{keccak256, Address, Bytes, TxHash, U256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use escrow_custody::audit::{AuditEntry, AuditFilter, AuditLog};
use escrow_custody::blockchain::types::{to_base_units, BlockchainError, BlockchainResult, SignedTransfer};
use escrow_custody::blockchain::ChainRpc;
use escrow_custody::custody::{KeyVault, MasterSecret};
use escrow_custody::escrow::{EngineSettings, EscrowEngine, EscrowVariant, NewEscrow, NewMilestone};
use escrow_custody::payments::TransactionDispatcher;
use escrow_custody::resilience::RetryPolicy;
use escrow_custody::security::ActorContext;
use escrow_custody::store::MemoryStore;
use escrow_custody::webhooks::WebhookNotifier;

pub const BUYER: &str = "0x1111111111111111111111111111111111111111";
pub const SELLER: &str = "0x2222222222222222222222222222222222222222";
pub const STRANGER: &str = "0x3333333333333333333333333333333333333333";

/// Flat network fee charged by [`MockChain`] per transfer (21000 gas at 1 gwei).
pub const FEE_WEI: u64 = 21_000_000_000_000;

pub fn addr(s: &str) -> Address {
    Address::from_str(s).unwrap()
}

pub fn buyer() -> ActorContext {
    ActorContext::user(addr(BUYER))
}

pub fn seller() -> ActorContext {
    ActorContext::user(addr(SELLER))
}

pub fn stranger() -> ActorContext {
    ActorContext::user(addr(STRANGER))
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn wei(eth: &str) -> U256 {
    to_base_units(dec(eth), 18).unwrap()
}

pub fn fee() -> U256 {
    U256::from(FEE_WEI)
}

pub fn simple_escrow(amount: &str) -> NewEscrow {
    NewEscrow {
        title: "Logo design".to_string(),
        description: Some("Three concepts, two revisions".to_string()),
        buyer: BUYER.to_string(),
        seller: SELLER.to_string(),
        amount: dec(amount),
        currency: "ETH".to_string(),
        variant: EscrowVariant::Simple,
        release_date: None,
        auto_release: false,
        milestones: Vec::new(),
    }
}

pub fn milestone_escrow(amount: &str, milestones: &[&str]) -> NewEscrow {
    NewEscrow {
        variant: EscrowVariant::Milestone,
        milestones: milestones
            .iter()
            .enumerate()
            .map(|(i, amount)| NewMilestone {
                title: format!("Phase {}", i + 1),
                description: None,
                amount: dec(amount),
            })
            .collect(),
        ..simple_escrow(amount)
    }
}

#[derive(Clone, Copy)]
enum Failure {
    Transient,
    Permanent,
}

/// Scripted chain: balances in memory, transfers move funds, failures on demand.
///
/// Signed transfers encode `from | to | value | nonce`; the hash is their
/// keccak. A hash that already landed is accepted again without moving funds,
/// the way a node answers "already known".
pub struct MockChain {
    balances: Mutex<HashMap<Address, U256>>,
    nonces: Mutex<HashMap<Address, u64>>,
    mined: Mutex<HashSet<TxHash>>,
    failures: Mutex<Vec<Failure>>,
    transfers: Mutex<Vec<(Address, Address, U256)>>,
    broadcasts: AtomicUsize,
    lost_acks: AtomicUsize,
    healthy: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    entered: Notify,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
            mined: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
            transfers: Mutex::new(Vec::new()),
            broadcasts: AtomicUsize::new(0),
            lost_acks: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            gate: Mutex::new(None),
            entered: Notify::new(),
        }
    }

    pub fn set_balance(&self, address: Address, value: U256) {
        self.balances.lock().unwrap().insert(address, value);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.balances.lock().unwrap().get(&address).copied().unwrap_or_default()
    }

    /// Fail the next `n` broadcasts with a retryable error.
    pub fn fail_transient(&self, n: usize) {
        self.failures.lock().unwrap().extend(std::iter::repeat(Failure::Transient).take(n));
    }

    /// Fail the next `n` broadcasts with a node rejection.
    pub fn fail_permanent(&self, n: usize) {
        self.failures.lock().unwrap().extend(std::iter::repeat(Failure::Permanent).take(n));
    }

    /// Apply the next `n` transfers but answer with a timeout.
    pub fn lose_acks(&self, n: usize) {
        self.lost_acks.fetch_add(n, Ordering::SeqCst);
    }

    /// Broadcast attempts, including failed ones.
    pub fn broadcasts(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }

    /// Successful transfers as (from, to, value).
    pub fn transfers(&self) -> Vec<(Address, Address, U256)> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Hold every broadcast until [`MockChain::open_gate`].
    pub fn close_gate(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Resolves once a broadcast is waiting at the gate.
    pub async fn broadcast_entered(&self) {
        self.entered.notified().await;
    }

    fn apply(&self, transfer: &SignedTransfer) -> BlockchainResult<()> {
        let raw = transfer.raw.as_ref();
        let from = Address::from_slice(&raw[0..20]);
        let to = Address::from_slice(&raw[20..40]);
        let value = U256::from_be_slice(&raw[40..72]);
        let nonce = u64::from_be_bytes(raw[72..80].try_into().unwrap());

        let mut nonces = self.nonces.lock().unwrap();
        let next = nonces.get(&from).copied().unwrap_or_default();
        if nonce != next {
            return Err(BlockchainError::Permanent("nonce too low".into()));
        }

        let mut balances = self.balances.lock().unwrap();
        let available = balances.get(&from).copied().unwrap_or_default();
        let cost = value + fee();
        if available < cost {
            return Err(BlockchainError::Permanent("insufficient funds for gas * price + value".into()));
        }
        balances.insert(from, available - cost);
        *balances.entry(to).or_default() += value;
        nonces.insert(from, next + 1);

        self.mined.lock().unwrap().insert(transfer.tx_hash);
        self.transfers.lock().unwrap().push((from, to, value));
        Ok(())
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn get_balance(&self, address: Address) -> BlockchainResult<U256> {
        Ok(self.balance(address))
    }

    async fn estimate_transfer_fee(&self) -> BlockchainResult<U256> {
        Ok(fee())
    }

    async fn sign_transfer(
        &self,
        signer: &PrivateKeySigner,
        to: Address,
        value: U256,
        _chain_id: u64,
    ) -> BlockchainResult<SignedTransfer> {
        let from = signer.address();
        let nonce = self.nonces.lock().unwrap().get(&from).copied().unwrap_or_default();

        let mut raw = Vec::with_capacity(80);
        raw.extend_from_slice(from.as_slice());
        raw.extend_from_slice(to.as_slice());
        raw.extend_from_slice(&value.to_be_bytes::<32>());
        raw.extend_from_slice(&nonce.to_be_bytes());

        Ok(SignedTransfer {
            tx_hash: keccak256(&raw),
            nonce,
            value,
            raw: Bytes::from(raw),
        })
    }

    async fn send_transfer(&self, transfer: &SignedTransfer) -> BlockchainResult<TxHash> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        match failure {
            Some(Failure::Transient) => return Err(BlockchainError::Transient("connection reset".into())),
            Some(Failure::Permanent) => return Err(BlockchainError::Permanent("nonce too low".into())),
            None => {}
        }

        if self.mined.lock().unwrap().contains(&transfer.tx_hash) {
            return Ok(transfer.tx_hash);
        }
        self.apply(transfer)?;

        let lost = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(BlockchainError::Timeout(5_000));
        }
        Ok(transfer.tx_hash)
    }

    async fn get_confirmations(&self, tx_hash: TxHash) -> BlockchainResult<Option<u64>> {
        Ok(self.mined.lock().unwrap().contains(&tx_hash).then_some(12))
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Engine wired to an in-memory store and a [`MockChain`].
pub struct Harness {
    pub engine: Arc<EscrowEngine>,
    pub chain: Arc<MockChain>,
    pub store: Arc<MemoryStore>,
    pub vault: Arc<KeyVault>,
    pub audit: AuditLog,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(EngineSettings::default(), RetryPolicy::immediate(3))
    }

    pub fn with(settings: EngineSettings, policy: RetryPolicy) -> Self {
        let secret = MasterSecret::new(b"integration-test-master-secret-0123456789".to_vec()).unwrap();
        let vault = Arc::new(KeyVault::new(secret));
        let chain = Arc::new(MockChain::new());
        let store = Arc::new(MemoryStore::new());
        let (audit, _worker) = AuditLog::start(store.clone(), 256);

        let dispatcher = Arc::new(TransactionDispatcher::new(
            store.clone(),
            store.clone(),
            vault.clone(),
            chain.clone(),
            audit.clone(),
            policy,
        ));
        let engine = Arc::new(EscrowEngine::new(
            store.clone(),
            vault.clone(),
            chain.clone(),
            dispatcher,
            audit.clone(),
            WebhookNotifier::disabled(),
            settings,
        ));

        Self {
            engine,
            chain,
            store,
            vault,
            audit,
        }
    }

    /// Create an escrow, put `deposit` in its custody wallet and mark it funded.
    pub async fn funded(&self, input: NewEscrow, deposit: &str) -> Uuid {
        let view = self.engine.create(input, &buyer()).await.unwrap();
        self.chain.set_balance(view.custody_address, wei(deposit));
        self.engine
            .mark_funded(view.id, "0xfeedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedfacefeedface", &buyer())
            .await
            .unwrap();
        view.id
    }

    /// Audit action names for an escrow, oldest first.
    pub async fn actions(&self, escrow_id: Uuid) -> Vec<String> {
        self.audit.flush().await;
        let mut entries: Vec<AuditEntry> = self.audit.query(&AuditFilter::for_escrow(escrow_id)).await.unwrap();
        entries.reverse();
        entries.iter().map(|e| e.action.name().to_string()).collect()
    }
}
