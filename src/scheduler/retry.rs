//! Retry policy: whether a failed attempt runs again and after how long.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self { backoff }
    }

    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self::new(BackoffConfig::Fixed { delay_ms: 0 })
    }

    /// `retry_count` is the number of retries already used.
    pub fn should_retry(&self, retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// ```
    /// use labgrid::config::BackoffConfig;
    /// use labgrid::scheduler::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(BackoffConfig::Exponential {
    ///     base_ms: 100,
    ///     max_ms: 1000,
    ///     jitter: false,
    /// });
    /// assert_eq!(policy.delay(1), Duration::from_millis(100));
    /// assert_eq!(policy.delay(3), Duration::from_millis(400));
    /// assert_eq!(policy.delay(10), Duration::from_millis(1000));
    /// ```
    pub fn delay(&self, retry: u32) -> Duration {
        match &self.backoff {
            BackoffConfig::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffConfig::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                let exponent = retry.saturating_sub(1).min(32);
                let raw = base_ms.saturating_mul(1u64 << exponent).min(*max_ms);
                let ms = if *jitter && raw > 0 {
                    let extra = rand::thread_rng().gen_range(0..=raw / 4);
                    raw.saturating_add(extra).min(*max_ms)
                } else {
                    raw
                };
                Duration::from_millis(ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_bound() {
        let policy = RetryPolicy::immediate();
        assert!(policy.should_retry(0, 2));
        assert!(policy.should_retry(1, 2));
        assert!(!policy.should_retry(2, 2));
        assert!(!policy.should_retry(0, 0));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(BackoffConfig::Fixed { delay_ms: 250 });
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(BackoffConfig::Exponential {
            base_ms: 1000,
            max_ms: 60_000,
            jitter: true,
        });
        for _ in 0..100 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2500));
        }
        assert!(policy.delay(30) <= Duration::from_millis(60_000));
    }
}
