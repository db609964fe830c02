//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the custody service.
//! All types derive Serde traits for deserialization from config files.
//!
//! The master encryption secret is deliberately absent: it is only ever read
//! from the environment variable named by [`CustodyConfig::master_secret_env`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration for the escrow custody service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener configuration (bind address, TLS, limits).
    pub listener: ListenerConfig,

    /// Blockchain integration settings.
    pub blockchain: BlockchainConfig,

    /// Key custody settings.
    pub custody: CustodyConfig,

    /// Payout retry configuration.
    pub retries: RetryConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Audit trail settings.
    pub audit: AuditConfig,

    /// Background sweep intervals.
    pub sweeps: SweepConfig,

    /// Outbound webhook subscribers.
    pub webhooks: WebhookConfig,

    /// Persistence settings.
    pub store: StoreConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Request timeout in seconds. Payout calls retry internally, so keep this generous.
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            request_timeout_secs: 120,
            max_body_bytes: 256 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Blockchain integration configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BlockchainConfig {
    /// JSON-RPC endpoint URL.
    pub rpc_url: String,

    /// Failover JSON-RPC endpoint URLs.
    #[serde(default)]
    pub failover_urls: Vec<String>,

    /// Chain ID (e.g., 1 for Ethereum mainnet, 31337 for local Anvil).
    pub chain_id: u64,

    /// Native currency symbol custody wallets can pay out.
    pub native_currency: String,

    /// Decimal places of the native currency.
    pub currency_decimals: u32,

    /// Read RPC request timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// Broadcast timeout in milliseconds. Must stay below the first retry delay.
    pub broadcast_timeout_ms: u64,

    /// Number of block confirmations required for finality.
    pub confirmation_blocks: u32,

    /// Gas price multiplier (1.0 = estimated, 1.2 = 20% buffer).
    pub gas_price_multiplier: f64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            failover_urls: Vec::new(),
            chain_id: 1,
            native_currency: "ETH".to_string(),
            currency_decimals: 18,
            rpc_timeout_secs: 10,
            broadcast_timeout_ms: 900,
            confirmation_blocks: 3,
            gas_price_multiplier: 1.2,
            max_gas_price_gwei: 500,
        }
    }
}

/// Key custody configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CustodyConfig {
    /// Environment variable holding the master encryption secret (>= 32 bytes).
    pub master_secret_env: String,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            master_secret_env: "ESCROW_MASTER_SECRET".to_string(),
        }
    }
}

/// Payout retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of broadcast attempts per payout.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Exponential growth factor.
    pub multiplier: f64,

    /// Maximum delay between attempts in milliseconds (before jitter).
    pub max_delay_ms: u64,

    /// Upper bound (exclusive) of the uniform jitter in milliseconds.
    pub max_jitter_ms: u64,

    /// Rows stuck in `processing` longer than this are reset by the recovery sweep.
    pub processing_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_jitter_ms: 1_000,
            processing_timeout_secs: 300,
        }
    }
}

/// Per-operation fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitPolicy {
    /// Requests allowed per window.
    pub max_requests: u32,

    /// Window length in milliseconds.
    pub window_ms: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Per-operation overrides keyed by operation class (e.g. "release-funds").
    pub overrides: HashMap<String, RateLimitPolicy>,

    /// Violations within the window after which an identifier is blocked.
    pub violation_block_threshold: u32,

    /// Violation look-back window in hours.
    pub violation_window_hours: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides: HashMap::new(),
            violation_block_threshold: 10,
            violation_window_hours: 24,
        }
    }
}

/// Audit trail configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Capacity of the audit outbox channel.
    pub channel_capacity: usize,

    /// Entries older than this are purged by the retention job (0 keeps everything).
    pub retention_days: u32,

    /// Retention job interval in seconds.
    pub retention_interval_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4_096,
            retention_days: 0,
            retention_interval_secs: 3_600,
        }
    }
}

/// Background sweep configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Time-locked auto-release sweep interval in seconds.
    pub auto_release_interval_secs: u64,

    /// Custody balance polling interval for funding detection in seconds.
    pub funding_check_interval_secs: u64,

    /// Payout recovery sweep interval in seconds.
    pub recovery_interval_secs: u64,

    /// Pending escrows older than this many hours expire (0 disables).
    pub funding_timeout_hours: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            auto_release_interval_secs: 60,
            funding_check_interval_secs: 30,
            recovery_interval_secs: 60,
            funding_timeout_hours: 0,
        }
    }
}

/// A single webhook subscriber.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookSubscriber {
    /// HTTPS endpoint.
    pub url: String,

    /// Shared secret used for HMAC signing.
    pub secret: String,

    /// Subscribed event types; empty means all.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub subscribers: Vec<WebhookSubscriber>,
    pub delivery_timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            delivery_timeout_secs: 10,
            max_attempts: 5,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot file for the built-in store. `None` keeps state in memory only.
    pub snapshot_path: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Placeholder admin key; validation rejects it while admin is enabled.
pub const PLACEHOLDER_ADMIN_KEY: &str = "CHANGE_ME_IN_PRODUCTION";

/// Longest rate-limit window an override may configure (7 days).
pub const MAX_RATE_LIMIT_WINDOW_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: PLACEHOLDER_ADMIN_KEY.to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
