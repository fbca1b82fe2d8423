//! Exponential retry backoff for redelivered pointers

use std::time::Duration;

use rand::Rng;

use crate::config::BrokerConfig;

/// Retry policy applied by the broker consumer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000, // 5 minutes
            jitter_factor: 0.1,
        }
    }
}

impl From<&BrokerConfig> for RetryPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.backoff_base_ms,
            max_delay_ms: config.backoff_cap_ms,
            jitter_factor: config.backoff_jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Whether a delivery that just failed on `attempt` may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before retrying after `attempt` (1-based) failed:
    /// `min(base * 2^(attempt-1), cap)` with symmetric jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let base_delay = self.base_delay_ms as f64 * 2f64.powi(exponent as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        // Apply jitter only if there is a range to draw from
        let jitter_range = capped_delay * self.jitter_factor;
        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).clamp(0.0, self.max_delay_ms as f64)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_factor: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_factor,
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let p = policy(0.0);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy(0.5);
        for _ in 0..100 {
            let d = p.delay_for(2).as_millis();
            assert!((100..=300).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_zero_base_means_immediate_retry() {
        let p = RetryPolicy {
            base_delay_ms: 0,
            ..policy(0.3)
        };
        assert_eq!(p.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_should_retry_bound() {
        let p = policy(0.0);
        assert!(p.should_retry(3));
        assert!(!p.should_retry(4));
    }
}
