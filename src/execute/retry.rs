//! Backoff policy for recoverable step failures.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            Duration::from_millis(config.jitter_ms),
        )
    }

    /// A policy with no delays, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before redelivering after a failure at the given attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exponential.min(self.cap);
        if self.jitter.is_zero() {
            return capped;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        capped + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::ZERO,
        );
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_is_bounded() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );
        for _ in 0..100 {
            let delay = policy.backoff(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(500),
            Duration::from_secs(30),
            Duration::ZERO,
        );
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }
}
