//! Retry schedule for transient reporter failures.

use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum backoff delay in seconds.
    pub max_delay_s: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_s: 10,
            backoff_multiplier: 2.0,
            max_retries: 3,
        }
    }
}

impl BackoffConfig {
    /// No waiting between attempts. Useful in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            initial_delay_ms: 0,
            max_retries,
            ..Default::default()
        }
    }

    /// Calculate next delay with exponential backoff.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let max_delay_ms = self.max_delay_s.saturating_mul(1000);
        let clamped_ms = delay_ms.min(max_delay_ms as f64) as u64;
        Duration::from_millis(clamped_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_then_clamp() {
        let config = BackoffConfig {
            initial_delay_ms: 500,
            max_delay_s: 3,
            backoff_multiplier: 2.0,
            max_retries: 5,
        };

        assert_eq!(config.next_delay(0), Duration::from_millis(500));
        assert_eq!(config.next_delay(1), Duration::from_millis(1_000));
        assert_eq!(config.next_delay(2), Duration::from_millis(2_000));
        assert_eq!(config.next_delay(3), Duration::from_millis(3_000));
        assert_eq!(config.next_delay(10), Duration::from_millis(3_000));
    }

    #[test]
    fn huge_ceiling_does_not_overflow() {
        let config = BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_s: u64::MAX,
            backoff_multiplier: 2.0,
            max_retries: 3,
        };
        assert_eq!(config.next_delay(2), Duration::from_millis(4_000));
    }

    #[test]
    fn immediate_never_waits() {
        let config = BackoffConfig::immediate(2);
        assert_eq!(config.next_delay(4), Duration::ZERO);
        assert_eq!(config.max_retries, 2);
    }
}
