//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, windows > 0)
//! - Enforce HTTPS-only webhook delivery
//! - Keep the broadcast timeout inside the backoff schedule
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;

use crate::config::schema::{ServiceConfig, MAX_RATE_LIMIT_WINDOW_MS, PLACEHOLDER_ADMIN_KEY};

/// A single semantic configuration problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // Blockchain
    if url::Url::parse(&config.blockchain.rpc_url).is_err() {
        errors.push(ValidationError::new("blockchain.rpc_url", "not a valid URL"));
    }
    for (i, failover) in config.blockchain.failover_urls.iter().enumerate() {
        if url::Url::parse(failover).is_err() {
            errors.push(ValidationError::new(
                format!("blockchain.failover_urls[{}]", i),
                "not a valid URL",
            ));
        }
    }
    if config.blockchain.rpc_timeout_secs == 0 {
        errors.push(ValidationError::new("blockchain.rpc_timeout_secs", "must be > 0"));
    }
    if config.blockchain.broadcast_timeout_ms == 0 {
        errors.push(ValidationError::new("blockchain.broadcast_timeout_ms", "must be > 0"));
    }
    if config.blockchain.broadcast_timeout_ms >= config.retries.initial_delay_ms {
        errors.push(ValidationError::new(
            "blockchain.broadcast_timeout_ms",
            "must be shorter than retries.initial_delay_ms",
        ));
    }
    if config.blockchain.currency_decimals > 28 {
        errors.push(ValidationError::new(
            "blockchain.currency_decimals",
            "must be <= 28",
        ));
    }
    if config.blockchain.gas_price_multiplier < 1.0 {
        errors.push(ValidationError::new(
            "blockchain.gas_price_multiplier",
            "must be >= 1.0",
        ));
    }

    // Custody
    if config.custody.master_secret_env.trim().is_empty() {
        errors.push(ValidationError::new("custody.master_secret_env", "must not be empty"));
    }

    // Retries
    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be >= 1"));
    }
    if config.retries.multiplier < 1.0 {
        errors.push(ValidationError::new("retries.multiplier", "must be >= 1.0"));
    }
    if config.retries.max_delay_ms < config.retries.initial_delay_ms {
        errors.push(ValidationError::new(
            "retries.max_delay_ms",
            "must be >= retries.initial_delay_ms",
        ));
    }

    // Rate limits
    for (operation, policy) in &config.rate_limit.overrides {
        if policy.max_requests == 0 || policy.window_ms == 0 {
            errors.push(ValidationError::new(
                format!("rate_limit.overrides.{}", operation),
                "max_requests and window_ms must be > 0",
            ));
        }
        if policy.window_ms > MAX_RATE_LIMIT_WINDOW_MS {
            errors.push(ValidationError::new(
                format!("rate_limit.overrides.{}.window_ms", operation),
                format!("must be <= {}", MAX_RATE_LIMIT_WINDOW_MS),
            ));
        }
    }
    if config.rate_limit.violation_window_hours == 0 {
        errors.push(ValidationError::new(
            "rate_limit.violation_window_hours",
            "must be > 0",
        ));
    }

    // Audit
    if config.audit.channel_capacity == 0 {
        errors.push(ValidationError::new("audit.channel_capacity", "must be > 0"));
    }

    // Webhooks: HTTPS only
    for (i, subscriber) in config.webhooks.subscribers.iter().enumerate() {
        match url::Url::parse(&subscriber.url) {
            Ok(url) if url.scheme() == "https" => {}
            Ok(_) => errors.push(ValidationError::new(
                format!("webhooks.subscribers[{}].url", i),
                "webhooks are delivered over HTTPS only",
            )),
            Err(_) => errors.push(ValidationError::new(
                format!("webhooks.subscribers[{}].url", i),
                "not a valid URL",
            )),
        }
        if subscriber.secret.is_empty() {
            errors.push(ValidationError::new(
                format!("webhooks.subscribers[{}].secret", i),
                "must not be empty",
            ));
        }
    }

    // Admin
    if config.admin.enabled && config.admin.api_key == PLACEHOLDER_ADMIN_KEY {
        errors.push(ValidationError::new(
            "admin.api_key",
            "placeholder key must be replaced when admin is enabled",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
