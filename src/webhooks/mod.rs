//! Outbound webhooks.
//!
//! # Data Flow
//! ```text
//! escrow engine event
//!     → payload.rs (WebhookPayload, event filter)
//!     → notifier.rs (spawned delivery per subscriber, retries)
//!     → signing.rs (X-Escrow-Signature)
//!     → subscriber HTTPS endpoint
//! ```

pub mod notifier;
pub mod payload;
pub mod signing;

pub use notifier::{WebhookError, WebhookNotifier};
pub use payload::{WebhookEvent, WebhookPayload};
