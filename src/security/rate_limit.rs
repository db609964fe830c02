//! Fixed-window rate limiting per actor and operation class.
//!
//! # Responsibilities
//! - Bound how often payout-triggering and balance operations run
//! - Count over-limit calls so repeat offenders can be blocked
//! - Swap policy tables on config reload without dropping live windows
//!
//! # Design Decisions
//! - State is process-local; losing it on restart only relaxes enforcement
//! - A window opens on the first request and lasts `window_ms`
//! - Blocking looks only at the violation history, not the live window

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::schema::MAX_RATE_LIMIT_WINDOW_MS;
use crate::config::{RateLimitConfig, RateLimitPolicy};
use crate::error::{EscrowError, EscrowResult};
use crate::observability::metrics;

/// Rate-limited operation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    ReleaseFunds,
    RefundFunds,
    CheckBalance,
}

impl OperationClass {
    pub const ALL: [OperationClass; 3] = [Self::ReleaseFunds, Self::RefundFunds, Self::CheckBalance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReleaseFunds => "release-funds",
            Self::RefundFunds => "refund-funds",
            Self::CheckBalance => "check-balance",
        }
    }

    pub fn default_policy(&self) -> RateLimitPolicy {
        match self {
            Self::ReleaseFunds | Self::RefundFunds => RateLimitPolicy {
                max_requests: 5,
                window_ms: 5 * 60 * 1000,
            },
            Self::CheckBalance => RateLimitPolicy {
                max_requests: 60,
                window_ms: 60 * 1000,
            },
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown operation class '{}'", s))
    }
}

/// Outcome of one `check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, at least 1.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(1) as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: DateTime<Utc>,
    count: u32,
}

type PolicyTable = HashMap<OperationClass, RateLimitPolicy>;

/// Window length, clamped so `start + len` stays inside chrono's range.
fn window_length(window_ms: u64) -> ChronoDuration {
    ChronoDuration::milliseconds(window_ms.min(MAX_RATE_LIMIT_WINDOW_MS) as i64)
}

fn policy_table(config: &RateLimitConfig) -> PolicyTable {
    let mut table: PolicyTable = OperationClass::ALL
        .into_iter()
        .map(|class| (class, class.default_policy()))
        .collect();
    for (name, policy) in &config.overrides {
        match name.parse::<OperationClass>() {
            Ok(class) => {
                table.insert(class, *policy);
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring rate limit override"),
        }
    }
    table
}

/// Process-local fixed-window limiter.
pub struct RateLimiter {
    enabled: bool,
    windows: DashMap<(String, OperationClass), Window>,
    violations: DashMap<String, Vec<DateTime<Utc>>>,
    policies: ArcSwap<PolicyTable>,
    block_threshold: u32,
    violation_window: ChronoDuration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            windows: DashMap::new(),
            violations: DashMap::new(),
            policies: ArcSwap::from_pointee(policy_table(config)),
            block_threshold: config.violation_block_threshold,
            violation_window: ChronoDuration::hours(config.violation_window_hours.min(24 * 365) as i64),
        }
    }

    /// Apply reloaded overrides. Live windows keep their counts.
    pub fn update_policies(&self, config: &RateLimitConfig) {
        self.policies.store(Arc::new(policy_table(config)));
        tracing::info!(overrides = config.overrides.len(), "Rate limit policies reloaded");
    }

    pub fn policy(&self, class: OperationClass) -> RateLimitPolicy {
        self.policies
            .load()
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_policy())
    }

    pub fn check(&self, identifier: &str, class: OperationClass) -> RateLimitDecision {
        self.check_at(identifier, class, Utc::now())
    }

    /// Count one request against `identifier`'s window for `class`.
    pub fn check_at(&self, identifier: &str, class: OperationClass, now: DateTime<Utc>) -> RateLimitDecision {
        let policy = self.policy(class);
        let window_len = window_length(policy.window_ms);

        if !self.enabled {
            return RateLimitDecision {
                allowed: true,
                remaining: policy.max_requests,
                reset_at: now + window_len,
            };
        }

        let window = {
            let mut entry = self
                .windows
                .entry((identifier.to_string(), class))
                .or_insert(Window { start: now, count: 0 });
            if now >= entry.start + window_len {
                *entry = Window { start: now, count: 0 };
            }
            entry.count = entry.count.saturating_add(1);
            *entry
        };

        let allowed = window.count <= policy.max_requests;
        if !allowed {
            self.record_violation(identifier, now);
            metrics::record_rate_limited(class.as_str());
            tracing::warn!(
                identifier,
                operation = class.as_str(),
                count = window.count,
                limit = policy.max_requests,
                "Rate limit exceeded"
            );
        }

        RateLimitDecision {
            allowed,
            remaining: policy.max_requests.saturating_sub(window.count),
            reset_at: window.start + window_len,
        }
    }

    pub fn is_blocked(&self, identifier: &str) -> bool {
        self.is_blocked_at(identifier, Utc::now())
    }

    /// More than `violation_block_threshold` violations inside the look-back window.
    pub fn is_blocked_at(&self, identifier: &str, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let horizon = now - self.violation_window;
        match self.violations.get_mut(identifier) {
            Some(mut history) => {
                history.retain(|t| *t > horizon);
                history.len() > self.block_threshold as usize
            }
            None => false,
        }
    }

    pub fn violation_count(&self, identifier: &str) -> usize {
        self.violations.get(identifier).map_or(0, |v| v.len())
    }

    /// Blocked check followed by a window check; the HTTP layer's entry point.
    pub fn enforce(&self, identifier: &str, class: OperationClass) -> EscrowResult<RateLimitDecision> {
        self.enforce_at(identifier, class, Utc::now())
    }

    pub fn enforce_at(
        &self,
        identifier: &str,
        class: OperationClass,
        now: DateTime<Utc>,
    ) -> EscrowResult<RateLimitDecision> {
        if self.is_blocked_at(identifier, now) {
            metrics::record_rate_limited(class.as_str());
            let retry_after = self
                .violations
                .get(identifier)
                .and_then(|v| v.iter().min().copied())
                .map(|oldest| (oldest + self.violation_window - now).num_seconds().max(1) as u64)
                .unwrap_or(1);
            tracing::warn!(identifier, operation = class.as_str(), "Blocked identifier rejected");
            return Err(EscrowError::RateLimitExceeded {
                retry_after_secs: retry_after,
            });
        }

        let decision = self.check_at(identifier, class, now);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(EscrowError::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs(now),
            })
        }
    }

    /// Drop expired windows and stale violation history.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        let policies = self.policies.load();
        self.windows.retain(|(_, class), window| {
            let window_ms = policies
                .get(class)
                .map_or(class.default_policy().window_ms, |p| p.window_ms);
            now < window.start + window_length(window_ms)
        });
        let horizon = now - self.violation_window;
        self.violations.retain(|_, history| {
            history.retain(|t| *t > horizon);
            !history.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Periodic purge until shutdown.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.purge_expired_at(Utc::now());
                        if removed > 0 {
                            tracing::debug!(removed, "Purged expired rate limit windows");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn record_violation(&self, identifier: &str, now: DateTime<Utc>) {
        self.violations
            .entry(identifier.to_string())
            .or_default()
            .push(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(&RateLimitConfig::default())
    }

    #[test]
    fn test_release_window_allows_five() {
        let limiter = limiter();
        let now = Utc::now();
        for i in 0..5 {
            let d = limiter.check_at("0xabc", OperationClass::ReleaseFunds, now);
            assert!(d.allowed);
            assert_eq!(d.remaining, 4 - i);
        }
        let d = limiter.check_at("0xabc", OperationClass::ReleaseFunds, now);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reset_at, now + ChronoDuration::minutes(5));
    }

    #[test]
    fn test_huge_window_is_clamped() {
        let mut config = RateLimitConfig::default();
        config.overrides.insert(
            "check-balance".into(),
            RateLimitPolicy { max_requests: 1, window_ms: u64::MAX },
        );
        let limiter = RateLimiter::new(&config);
        let now = Utc::now();

        assert!(limiter.check_at("0xabc", OperationClass::CheckBalance, now).allowed);
        let d = limiter.check_at("0xabc", OperationClass::CheckBalance, now);
        assert!(!d.allowed);
        assert_eq!(d.reset_at, now + ChronoDuration::days(7));
        assert_eq!(limiter.purge_expired_at(now), 0);
    }

    #[test]
    fn test_window_resets() {
        let limiter = limiter();
        let start = Utc::now();
        for _ in 0..6 {
            limiter.check_at("0xabc", OperationClass::ReleaseFunds, start);
        }
        let later = start + ChronoDuration::minutes(5);
        assert!(limiter.check_at("0xabc", OperationClass::ReleaseFunds, later).allowed);
    }

    #[test]
    fn test_classes_and_identifiers_are_independent() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..6 {
            limiter.check_at("0xabc", OperationClass::ReleaseFunds, now);
        }
        assert!(limiter.check_at("0xabc", OperationClass::CheckBalance, now).allowed);
        assert!(limiter.check_at("0xdef", OperationClass::ReleaseFunds, now).allowed);
    }

    #[test]
    fn test_blocked_after_threshold_violations() {
        let limiter = limiter();
        let now = Utc::now();
        // 5 allowed, then 11 violations.
        for _ in 0..16 {
            limiter.check_at("0xabc", OperationClass::ReleaseFunds, now);
        }
        assert_eq!(limiter.violation_count("0xabc"), 11);
        assert!(limiter.is_blocked_at("0xabc", now));
        assert!(!limiter.is_blocked_at("0xabc", now + ChronoDuration::hours(25)));
    }

    #[test]
    fn test_ten_violations_do_not_block() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..15 {
            limiter.check_at("0xabc", OperationClass::ReleaseFunds, now);
        }
        assert!(!limiter.is_blocked_at("0xabc", now));
    }

    #[test]
    fn test_enforce_returns_retry_after() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..5 {
            limiter.enforce_at("0xabc", OperationClass::RefundFunds, now).unwrap();
        }
        let err = limiter
            .enforce_at("0xabc", OperationClass::RefundFunds, now + ChronoDuration::seconds(60))
            .unwrap_err();
        match err {
            EscrowError::RateLimitExceeded { retry_after_secs } => assert_eq!(retry_after_secs, 240),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_overrides_and_reload() {
        let mut config = RateLimitConfig::default();
        config.overrides.insert(
            "check-balance".into(),
            RateLimitPolicy {
                max_requests: 1,
                window_ms: 1_000,
            },
        );
        let limiter = RateLimiter::new(&config);
        let now = Utc::now();
        assert!(limiter.check_at("ip", OperationClass::CheckBalance, now).allowed);
        assert!(!limiter.check_at("ip", OperationClass::CheckBalance, now).allowed);

        limiter.update_policies(&RateLimitConfig::default());
        assert_eq!(limiter.policy(OperationClass::CheckBalance).max_requests, 60);
        assert!(limiter.check_at("ip", OperationClass::CheckBalance, now).allowed);
    }

    #[test]
    fn test_disabled_allows_everything() {
        let config = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(&config);
        let now = Utc::now();
        for _ in 0..100 {
            assert!(limiter.check_at("0xabc", OperationClass::ReleaseFunds, now).allowed);
        }
        assert!(!limiter.is_blocked_at("0xabc", now));
    }

    #[test]
    fn test_purge_expired() {
        let limiter = limiter();
        let now = Utc::now();
        limiter.check_at("a", OperationClass::CheckBalance, now);
        limiter.check_at("b", OperationClass::ReleaseFunds, now);
        assert_eq!(limiter.purge_expired_at(now + ChronoDuration::minutes(2)), 1);
        assert_eq!(limiter.purge_expired_at(now + ChronoDuration::minutes(10)), 1);
    }

    #[test]
    fn test_operation_class_parse() {
        assert_eq!("refund-funds".parse::<OperationClass>(), Ok(OperationClass::RefundFunds));
        assert!("withdraw".parse::<OperationClass>().is_err());
    }
}
