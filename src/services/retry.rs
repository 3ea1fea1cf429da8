//! Bounded exponential backoff for part uploads.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How often, and how patiently, a failed part upload is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries + 1` attempts in total.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// No waiting between attempts. Used by tests and by callers that do
    /// their own pacing.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0;
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        // 0.5s, 1s, 2s, 4s, 8s, 8s ...
        let expected_base = [0.5, 1.0, 2.0, 4.0, 8.0, 8.0, 8.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let secs = policy.delay_for_attempt((i + 1) as u32).as_secs_f64();
            let (lo, hi) = (base * 0.74, base * 1.26);
            assert!(
                secs >= lo && secs <= hi,
                "attempt {}: {secs:.3}s not in [{lo:.3}, {hi:.3}]",
                i + 1
            );
        }
    }

    #[test]
    fn immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(10), Duration::ZERO);
        assert_eq!(policy.max_attempts(), 3);
    }
}
