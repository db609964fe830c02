//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated, immutable)
//!     → shared by value/Arc with every service at startup
//!
//! Environment:
//!     custody.master_secret_env → custody::MasterSecret (never in the file)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → changed rate_limit section forwarded
//!     → security::RateLimiter swaps its policy table (arc-swap)
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Missing master secret is a hard startup failure
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, AuditConfig, BlockchainConfig, CustodyConfig, ListenerConfig,
    ObservabilityConfig, RateLimitConfig, RateLimitPolicy, RetryConfig, ServiceConfig,
    StoreConfig, SweepConfig, WebhookConfig, WebhookSubscriber,
};
