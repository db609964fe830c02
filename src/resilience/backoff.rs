//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Calculate the delay that follows failed attempt `attempt` (0-indexed).
///
/// `min(initial * multiplier^attempt, max) + jitter`, jitter uniform in `[0, max_jitter)`.
pub fn calculate_backoff(
    attempt: u32,
    initial_ms: u64,
    multiplier: f64,
    max_ms: u64,
    max_jitter_ms: u64,
) -> Duration {
    let exponential = initial_ms as f64 * multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let capped_delay = if exponential.is_finite() {
        (exponential as u64).min(max_ms)
    } else {
        max_ms
    };

    let jitter = if max_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..max_jitter_ms)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Retry schedule for payout broadcasts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl RetryPolicy {
    /// No waiting between attempts; used where wall-clock delays get in the way.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            max_jitter_ms: 0,
        }
    }

    /// Delay after failed attempt `attempt` (0-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        calculate_backoff(
            attempt,
            self.initial_delay_ms,
            self.multiplier,
            self.max_delay_ms,
            self.max_jitter_ms,
        )
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay_ms,
            multiplier: config.multiplier,
            max_delay_ms: config.max_delay_ms,
            max_jitter_ms: config.max_jitter_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_without_jitter() {
        assert_eq!(calculate_backoff(0, 1_000, 2.0, 30_000, 0), Duration::from_millis(1_000));
        assert_eq!(calculate_backoff(1, 1_000, 2.0, 30_000, 0), Duration::from_millis(2_000));
        assert_eq!(calculate_backoff(2, 1_000, 2.0, 30_000, 0), Duration::from_millis(4_000));
        assert_eq!(calculate_backoff(10, 1_000, 2.0, 30_000, 0), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let delay = calculate_backoff(0, 1_000, 2.0, 30_000, 1_000);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay < Duration::from_millis(2_000));
        }
    }

    #[test]
    fn test_base_delay_is_non_decreasing() {
        let policy = RetryPolicy {
            max_jitter_ms: 0,
            ..RetryPolicy::default()
        };
        let delays: Vec<_> = (0..8).map(|n| policy.delay_after(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_huge_attempt_saturates() {
        assert_eq!(
            calculate_backoff(u32::MAX, 1_000, 2.0, 30_000, 0),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn test_immediate_policy() {
        assert_eq!(RetryPolicy::immediate(3).delay_after(5), Duration::ZERO);
    }
}
