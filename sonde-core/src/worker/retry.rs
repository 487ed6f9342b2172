use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff policy for result submission.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total requests made, the first included.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Un-jittered delay after `attempt` failed requests: the base doubled
    /// per attempt, capped at the maximum.
    pub fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = i32::from(attempt.saturating_sub(1));
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        scaled.min(self.backoff_max_ms as f64).max(0.0) as u64
    }

    /// Delay to sleep before the next request.
    pub fn delay_for(&self, attempt: u16) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return Duration::ZERO;
        }

        let span = (anchor as f64) * f64::from(self.jitter_ratio.max(0.0));
        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(self.backoff_max_ms as f64);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }

        let jittered = rand::rng().random_range(lower..=upper);
        Duration::from_millis(jittered.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.base_delay_ms(0), 0);
        assert_eq!(retry.base_delay_ms(1), 1_000);
        assert_eq!(retry.base_delay_ms(2), 2_000);
        assert_eq!(retry.base_delay_ms(3), 4_000);
        assert_eq!(retry.base_delay_ms(5), 10_000);
        assert_eq!(retry.base_delay_ms(40), 10_000);
    }

    #[test]
    fn jitter_stays_in_band() {
        let retry = RetryConfig::default();
        for _ in 0..100 {
            let delay = retry.delay_for(2).as_millis();
            assert!((1_800..=2_200).contains(&delay), "{delay}");
        }
        // The cap also bounds jitter.
        assert!(retry.delay_for(10) <= retry.backoff_max());
    }

    #[test]
    fn zero_jitter_is_exact() {
        let retry = RetryConfig {
            jitter_ratio: 0.0,
            ..Default::default()
        };
        assert_eq!(retry.delay_for(3), Duration::from_millis(4_000));
    }
}
