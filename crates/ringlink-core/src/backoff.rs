//! Bucketed exponential backoff with symmetric jitter
//!
//! Base delay by attempt number `n` (1-indexed):
//!
//! | attempts | base |
//! |----------|------|
//! | 1..=5    | short (10 s) |
//! | 6..=10   | medium (30 s) |
//! | 11..     | long (60 s) doubled per attempt past 11, capped at 300 s |
//!
//! Jitter of up to `jitter_ratio * base` is added or subtracted and the result is
//! clamped to `[min_delay, max_delay]`.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;

/// Reconnect delay calculator
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: ReconnectConfig,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

impl BackoffPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Un-jittered delay for attempt `n`; attempt 0 is treated as 1
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        match n {
            1..=5 => self.config.short_base,
            6..=10 => self.config.medium_base,
            _ => {
                let max_ms = self.config.max_base.as_millis() as u64;
                let long_ms = self.config.long_base.as_millis() as u64;
                let doubled = 1u64
                    .checked_shl(n - 11)
                    .and_then(|factor| long_ms.checked_mul(factor))
                    .unwrap_or(max_ms);
                Duration::from_millis(doubled.min(max_ms))
            }
        }
    }

    /// Largest jitter magnitude for attempt `n`
    pub fn jitter_span(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as f64;
        Duration::from_millis((base_ms * self.config.jitter_ratio).round() as u64)
    }

    /// Jittered, clamped delay for attempt `n`
    pub fn next_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as i64;
        let span_ms = self.jitter_span(attempt).as_millis() as i64;
        let jitter_ms = if span_ms > 0 {
            rng.gen_range(-span_ms..=span_ms)
        } else {
            0
        };
        self.clamp(Duration::from_millis((base_ms + jitter_ms).max(0) as u64))
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.config.min_delay, self.config.max_delay)
    }

    pub fn min_delay(&self) -> Duration {
        self.config.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.config.max_delay
    }
}
