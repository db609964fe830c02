//! Payout execution.
//!
//! # Data Flow
//! ```text
//! escrow engine → PayoutRequest
//!     → dispatcher.rs (claim key, decrypt, sign, broadcast, retry)
//!     → RetryableTransaction rows in the PayoutStore
//!     → PayoutReceipt back to the engine
//! ```

pub mod dispatcher;
pub mod types;

pub use dispatcher::TransactionDispatcher;
pub use types::{
    PayoutAmount, PayoutKey, PayoutKind, PayoutReceipt, PayoutRequest, PayoutStatus,
    RetryableTransaction,
};
