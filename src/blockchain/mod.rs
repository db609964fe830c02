//! Blockchain integration subsystem.
//!
//! # Data Flow
//! ```text
//! custody::vault (decrypted key)
//!     → wallet.rs (signer construction)
//!     → client.rs (ChainRpc: fee estimate, sign once, submit with timeouts)
//!     → transaction.rs (confirmation polling)
//! ```
//!
//! # Security Constraints
//! - Signers exist only for the duration of one payout
//! - Never log private keys or sensitive data
//! - All RPC calls have configurable timeouts
//! - Graceful degradation when blockchain unreachable

pub mod client;
pub mod transaction;
pub mod types;
pub mod wallet;

pub use client::{AlloyRpcClient, ChainRpc};
pub use types::{
    from_base_units, to_base_units, BlockchainConfig, BlockchainError, BlockchainResult, ChainId,
    ConfirmationStatus, SignedTransfer,
};
