//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → access_control.rs (X-Actor-Address → ActorContext, origin for audit)
//!     → rate_limit.rs (blocked check, then fixed window per operation class)
//!     → escrow engine (role checks per operation)
//! ```
//!
//! # Design Decisions
//! - Fail closed: a missing or malformed actor header rejects the call
//! - Rate-limit rejections carry a retry-after hint

pub mod access_control;
pub mod rate_limit;

pub use access_control::{ActorContext, X_ACTOR_ADDRESS};
pub use rate_limit::{OperationClass, RateLimitDecision, RateLimiter};
