//! Escrow lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! HTTP handler / sweep
//!     → engine.rs (validate, role check, compare-and-swap status)
//!     → payments::TransactionDispatcher (for release / refund / milestone)
//!     → engine.rs finalize (status advances only after payout success)
//!     → audit + webhooks
//!
//! sweeper.rs (timers):
//!     auto-release (timelock.rs), funding detection, expiry, payout recovery
//! ```

pub mod engine;
pub mod sweeper;
pub mod timelock;
pub mod types;

pub use engine::{BalanceReport, EngineSettings, EscrowDetails, EscrowEngine, MilestoneRelease};
pub use sweeper::{run_recovery_once, RecoveryReport, Sweeper};
pub use types::{
    Actor, Amount, Escrow, EscrowStatus, EscrowVariant, EscrowView, Milestone, MilestoneStatus,
    NewEscrow, NewMilestone,
};
