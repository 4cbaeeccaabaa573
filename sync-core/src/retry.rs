// Retry policy - exponential backoff with jitter for failed sync items

use crate::config::RetryConfig;
use crate::error::Error;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// What to do with an item after a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending, claimable from `next_attempt_at`
    Retry { next_attempt_at: DateTime<Utc> },
    /// Retries exhausted
    DeadLetter,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Total attempts allowed, first one included
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    /// Delay before the nth retry (0-based), exponential backoff + jitter
    pub fn calculate_delay(&self, retry: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(retry.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        // Jitter spreads retries of items that failed together
        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Decide the fate of an item that failed after `attempts` claims
    pub fn decide(&self, attempts: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempts >= self.max_attempts() {
            return RetryDecision::DeadLetter;
        }

        let delay = self.calculate_delay(attempts.saturating_sub(1));
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        RetryDecision::Retry {
            next_attempt_at: now + delay,
        }
    }

    /// Whether an error from a LOS call is worth retrying
    pub fn is_retryable_error(error: &Error) -> bool {
        match error {
            Error::ExternalUnavailable(_) => true,
            Error::Concurrency(_) => true,
            Error::StorageBusy(_) => true,

            Error::Validation(_) => false,
            Error::ExternalRejected(_) => false,
            Error::Configuration(_) => false,
            Error::NotFound(_) => false,

            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter();

        assert_eq!(policy.calculate_delay(0).as_millis(), 1000);
        assert_eq!(policy.calculate_delay(1).as_millis(), 2000);
        assert_eq!(policy.calculate_delay(2).as_millis(), 4000);
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = no_jitter();
        assert_eq!(policy.calculate_delay(20).as_millis(), 10000);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::with_defaults();
        for _ in 0..100 {
            let delay = policy.calculate_delay(0).as_millis();
            assert!((1800..=2200).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_dead_letter_after_max_attempts() {
        let policy = no_jitter();
        let now = Utc::now();

        assert!(matches!(policy.decide(1, now), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(3, now), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(4, now), RetryDecision::DeadLetter);
    }

    #[test]
    fn test_retry_is_scheduled_in_future() {
        let policy = no_jitter();
        let now = Utc::now();

        match policy.decide(2, now) {
            RetryDecision::Retry { next_attempt_at } => {
                assert_eq!((next_attempt_at - now).num_milliseconds(), 2000);
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RetryPolicy::is_retryable_error(&Error::ExternalUnavailable(
            "timeout".to_string()
        )));
        assert!(!RetryPolicy::is_retryable_error(&Error::ExternalRejected(
            "Invalid amount".to_string()
        )));
        assert!(!RetryPolicy::is_retryable_error(&Error::Validation(
            "empty".to_string()
        )));

        // Decided by variant, not by message text
        assert!(RetryPolicy::is_retryable_error(&Error::StorageBusy(
            "database is busy".to_string()
        )));
        assert!(!RetryPolicy::is_retryable_error(&Error::Storage(
            "table locked_loans is corrupt".to_string()
        )));
    }
}
