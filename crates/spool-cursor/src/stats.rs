//! Per-endpoint peek reply statistics and slow-replica detection.
//!
//! Each leaf cursor keeps one [`PeekStats`] per endpoint. Replies are
//! classified into fast, slow and unknown; when a window closes with enough
//! slow replies, the cursor asks the transport to reset the connection.
//! Statistics are advisory and never affect peek correctness.

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

use crate::config::CursorConfig;

/// How one reply was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// Answered within the latency budget.
    Fast,
    /// Over budget with a payload large enough to blame the link.
    Slow,
    /// Over budget but too small to draw a conclusion from.
    Unknown,
}

/// Rolling reply statistics for a single endpoint.
#[derive(Debug)]
pub struct PeekStats {
    interval: Duration,
    max_latency: Duration,
    reset_interval: Duration,
    slow_amount: u64,
    slow_ratio: f64,
    min_bytes: usize,

    window_started: Instant,
    fast: u64,
    slow: u64,
    unknown: u64,
    last_reset: Option<Instant>,
}

impl PeekStats {
    /// Creates statistics with the thresholds of `config`. The reset clock
    /// starts satisfied, so a reset may fire as soon as the first window
    /// closes.
    #[must_use]
    pub fn new(config: &CursorConfig) -> Self {
        Self {
            interval: config.peek_stats_interval_duration(),
            max_latency: config.peek_max_latency_duration(),
            reset_interval: config.peek_reset_interval_duration(),
            slow_amount: config.peek_stats_slow_amount,
            slow_ratio: config.peek_stats_slow_ratio,
            min_bytes: config.peek_stats_min_bytes,
            window_started: Instant::now(),
            fast: 0,
            slow: 0,
            unknown: 0,
            last_reset: None,
        }
    }

    /// Records one reply and returns `true` when the endpoint's connection
    /// should be reset.
    ///
    /// The decision is evaluated when a statistics window closes: the window
    /// must hold at least `peek_stats_slow_amount` slow replies, the slow
    /// fraction of conclusive replies must reach `peek_stats_slow_ratio`,
    /// and the previous reset must be at least `peek_reset_interval` old.
    pub fn record_reply(&mut self, latency: Duration, payload_bytes: usize) -> bool {
        histogram!("spool_peek_latency_ms").record(latency.as_secs_f64() * 1_000.0);

        match self.classify(latency, payload_bytes) {
            ReplyClass::Fast => self.fast += 1,
            ReplyClass::Slow => self.slow += 1,
            ReplyClass::Unknown => self.unknown += 1,
        }

        if self.window_started.elapsed() < self.interval {
            return false;
        }

        let spacing_ok =
            self.last_reset.map_or(true, |at| at.elapsed() >= self.reset_interval);
        let decision = self.window_wants_reset() && spacing_ok;
        self.fast = 0;
        self.slow = 0;
        self.unknown = 0;
        self.window_started = Instant::now();
        if decision {
            self.last_reset = Some(Instant::now());
            counter!("spool_peek_connection_resets").increment(1);
        }
        decision
    }

    /// Classifies a reply without recording it.
    #[must_use]
    pub fn classify(&self, latency: Duration, payload_bytes: usize) -> ReplyClass {
        if latency <= self.max_latency {
            ReplyClass::Fast
        } else if payload_bytes >= self.min_bytes {
            ReplyClass::Slow
        } else {
            ReplyClass::Unknown
        }
    }

    /// Fast replies in the current window.
    #[must_use]
    pub fn fast(&self) -> u64 {
        self.fast
    }

    /// Slow replies in the current window.
    #[must_use]
    pub fn slow(&self) -> u64 {
        self.slow
    }

    /// Unclassifiable replies in the current window.
    #[must_use]
    pub fn unknown(&self) -> u64 {
        self.unknown
    }

    fn window_wants_reset(&self) -> bool {
        if self.slow < self.slow_amount {
            return false;
        }
        let conclusive = self.slow + self.fast;
        conclusive > 0 && self.slow as f64 / conclusive as f64 >= self.slow_ratio
    }
}
