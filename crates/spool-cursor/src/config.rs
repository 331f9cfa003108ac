//! Configuration knobs for the peek cursor engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base backoff between empty-reply retries in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Default cap for the exponential empty-reply backoff in milliseconds.
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 2_000;

/// Default number of empty-reply retries per refill call.
pub const DEFAULT_RETRY_TIMES: u32 = 8;

/// Default length of the slow-replica statistics window in milliseconds.
pub const DEFAULT_PEEK_STATS_INTERVAL_MS: u64 = 10_000;

/// Default number of slow replies required before a window can trigger a
/// connection reset.
pub const DEFAULT_PEEK_STATS_SLOW_AMOUNT: u64 = 20;

/// Default slow/(slow+fast) ratio required to trigger a connection reset.
pub const DEFAULT_PEEK_STATS_SLOW_RATIO: f64 = 0.5;

/// Default latency above which a reply counts as slow, in milliseconds.
pub const DEFAULT_PEEK_MAX_LATENCY_MS: u64 = 500;

/// Default minimum spacing between connection resets in milliseconds.
pub const DEFAULT_PEEK_RESET_INTERVAL_MS: u64 = 300_000;

/// Default payload size below which a slow reply counts as unknown rather
/// than slow (small replies say little about the link).
pub const DEFAULT_PEEK_STATS_MIN_BYTES: usize = 64 * 1024;

/// Default number of in-flight peeks per leaf cursor.
pub const DEFAULT_PARALLEL_GET_MORE_REQUESTS: u32 = 1;

/// Configuration for peek cursors. Immutable after cursor construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Base backoff between empty-reply retries in milliseconds.
    pub retry_delay_ms: u64,

    /// Cap for the exponential empty-reply backoff in milliseconds.
    pub max_retry_delay_ms: u64,

    /// Maximum number of empty-reply retries per refill call. When a leaf
    /// stays empty for this many attempts, the merge cursor reports
    /// not-ready and the caller retries.
    pub retry_times: u32,

    /// Length of the slow-replica statistics window in milliseconds.
    pub peek_stats_interval_ms: u64,

    /// Number of slow replies required before a window can trigger a
    /// connection reset.
    pub peek_stats_slow_amount: u64,

    /// Slow/(slow+fast) ratio required to trigger a connection reset.
    pub peek_stats_slow_ratio: f64,

    /// Latency above which a reply counts as slow, in milliseconds.
    pub peek_max_latency_ms: u64,

    /// Minimum spacing between connection resets in milliseconds.
    pub peek_reset_interval_ms: u64,

    /// Payload size below which a slow reply counts as unknown.
    pub peek_stats_min_bytes: usize,

    /// Number of in-flight peeks per leaf when pipelined mode is enabled.
    ///
    /// Only 1 is accepted; see [`CursorConfig::validate`].
    pub parallel_get_more_requests: u32,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            retry_times: DEFAULT_RETRY_TIMES,
            peek_stats_interval_ms: DEFAULT_PEEK_STATS_INTERVAL_MS,
            peek_stats_slow_amount: DEFAULT_PEEK_STATS_SLOW_AMOUNT,
            peek_stats_slow_ratio: DEFAULT_PEEK_STATS_SLOW_RATIO,
            peek_max_latency_ms: DEFAULT_PEEK_MAX_LATENCY_MS,
            peek_reset_interval_ms: DEFAULT_PEEK_RESET_INTERVAL_MS,
            peek_stats_min_bytes: DEFAULT_PEEK_STATS_MIN_BYTES,
            parallel_get_more_requests: DEFAULT_PARALLEL_GET_MORE_REQUESTS,
        }
    }
}

impl CursorConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base retry backoff.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the retry backoff cap.
    #[must_use]
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the number of empty-reply retries per refill.
    #[must_use]
    pub fn retry_times(mut self, times: u32) -> Self {
        self.retry_times = times;
        self
    }

    /// Sets the slow-replica statistics window length.
    #[must_use]
    pub fn peek_stats_interval(mut self, interval: Duration) -> Self {
        self.peek_stats_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the slow-reply count threshold.
    #[must_use]
    pub fn peek_stats_slow_amount(mut self, amount: u64) -> Self {
        self.peek_stats_slow_amount = amount;
        self
    }

    /// Sets the slow-reply ratio threshold.
    #[must_use]
    pub fn peek_stats_slow_ratio(mut self, ratio: f64) -> Self {
        self.peek_stats_slow_ratio = ratio;
        self
    }

    /// Sets the latency above which a reply counts as slow.
    #[must_use]
    pub fn peek_max_latency(mut self, latency: Duration) -> Self {
        self.peek_max_latency_ms = latency.as_millis() as u64;
        self
    }

    /// Sets the minimum spacing between connection resets.
    #[must_use]
    pub fn peek_reset_interval(mut self, interval: Duration) -> Self {
        self.peek_reset_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the payload size below which slow replies count as unknown.
    #[must_use]
    pub fn peek_stats_min_bytes(mut self, bytes: usize) -> Self {
        self.peek_stats_min_bytes = bytes;
        self
    }

    /// Returns the base retry backoff as a `Duration`.
    #[must_use]
    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Returns the statistics window as a `Duration`.
    #[must_use]
    pub fn peek_stats_interval_duration(&self) -> Duration {
        Duration::from_millis(self.peek_stats_interval_ms)
    }

    /// Returns the latency threshold as a `Duration`.
    #[must_use]
    pub fn peek_max_latency_duration(&self) -> Duration {
        Duration::from_millis(self.peek_max_latency_ms)
    }

    /// Returns the reset spacing as a `Duration`.
    #[must_use]
    pub fn peek_reset_interval_duration(&self) -> Duration {
        Duration::from_millis(self.peek_reset_interval_ms)
    }

    /// Computes the backoff before retry number `attempt` (zero-based):
    /// `retry_delay * 2^attempt`, capped at `max_retry_delay`.
    #[must_use]
    pub fn backoff_for_retry(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.retry_delay_ms.saturating_mul(factor).min(self.max_retry_delay_ms);
        Duration::from_millis(delay)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.retry_times == 0 {
            return Err(ConfigValidationError::InvalidRetryTimes);
        }
        if self.retry_delay_ms == 0 || self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(ConfigValidationError::InvalidRetryDelay);
        }
        if !(self.peek_stats_slow_ratio > 0.0 && self.peek_stats_slow_ratio <= 1.0) {
            return Err(ConfigValidationError::InvalidSlowRatio);
        }
        if self.parallel_get_more_requests != 1 {
            return Err(ConfigValidationError::UnsupportedParallelPeek);
        }
        Ok(())
    }
}

/// Errors from configuration validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigValidationError {
    /// At least one refill attempt is required.
    #[error("retry times must be at least 1")]
    InvalidRetryTimes,

    /// Backoff must be positive and the cap at least the base.
    #[error("retry delay must be positive and no larger than its cap")]
    InvalidRetryDelay,

    /// The slow-reply ratio must be a fraction in (0, 1].
    #[error("slow-reply ratio must be in (0, 1]")]
    InvalidSlowRatio,

    /// Pipelined peeks are not supported.
    #[error("pipelined peek mode is not supported; parallel_get_more_requests must be 1")]
    UnsupportedParallelPeek,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CursorConfig::default();
        assert_eq!(config.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        assert_eq!(config.retry_times, DEFAULT_RETRY_TIMES);
        assert_eq!(config.parallel_get_more_requests, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = CursorConfig::new()
            .retry_delay(Duration::from_millis(10))
            .max_retry_delay(Duration::from_millis(500))
            .retry_times(3)
            .peek_max_latency(Duration::from_millis(50))
            .peek_stats_slow_amount(5)
            .peek_stats_slow_ratio(0.25)
            .peek_stats_interval(Duration::from_secs(1))
            .peek_reset_interval(Duration::from_secs(30))
            .peek_stats_min_bytes(128);

        assert_eq!(config.retry_delay_ms, 10);
        assert_eq!(config.max_retry_delay_ms, 500);
        assert_eq!(config.retry_times, 3);
        assert_eq!(config.peek_max_latency_ms, 50);
        assert_eq!(config.peek_stats_slow_amount, 5);
        assert_eq!(config.peek_stats_slow_ratio, 0.25);
        assert_eq!(config.peek_stats_interval_ms, 1_000);
        assert_eq!(config.peek_reset_interval_ms, 30_000);
        assert_eq!(config.peek_stats_min_bytes, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let config = CursorConfig::new()
            .retry_delay(Duration::from_millis(100))
            .max_retry_delay(Duration::from_millis(1_000));

        assert_eq!(config.backoff_for_retry(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_retry(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_retry(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for_retry(3), Duration::from_millis(800));
        assert_eq!(config.backoff_for_retry(4), Duration::from_millis(1_000));
        assert_eq!(config.backoff_for_retry(63), Duration::from_millis(1_000));
    }

    #[test]
    fn test_validation() {
        assert!(CursorConfig::new().retry_times(0).validate().is_err());

        let config = CursorConfig { retry_delay_ms: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = CursorConfig { max_retry_delay_ms: 1, ..Default::default() };
        assert!(config.validate().is_err());

        assert!(CursorConfig::new().peek_stats_slow_ratio(0.0).validate().is_err());
        assert!(CursorConfig::new().peek_stats_slow_ratio(1.5).validate().is_err());

        let config = CursorConfig { parallel_get_more_requests: 4, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::UnsupportedParallelPeek)
        ));
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = CursorConfig::new().retry_times(5).peek_stats_slow_amount(7);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CursorConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.retry_times, 5);
        assert_eq!(parsed.peek_stats_slow_amount, 7);
    }
}
