//! Reconnect Backoff
//!
//! Retry `n` (zero-based) waits `min(initial · multiplier^n, max)` plus a
//! uniform jitter in `[0, jitter_factor · that]`. A cycle allows at most
//! `max(max_attempts, 1)` retries; the supervisor gives up after that.

use std::time::Duration;

use rand::Rng;

/// Backoff tuning for upstream reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the un-jittered wait.
    pub max_delay: Duration,
    /// Growth per retry.
    pub multiplier: f64,
    /// Extra random wait as a fraction of the capped wait.
    pub jitter_factor: f64,
    /// Retries per cycle. Zero behaves as one.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.3,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Wait before retry `retry`, capped and without jitter.
    #[must_use]
    pub fn capped_delay(&self, retry: u32) -> Duration {
        let ceiling = self.max_delay.as_secs_f64();
        let grown = self.initial_delay.as_secs_f64()
            * self.multiplier.powi(i32::try_from(retry).unwrap_or(i32::MAX));

        let secs = if grown.is_nan() || grown <= 0.0 {
            0.0
        } else {
            grown.min(ceiling)
        };
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    /// Wait before retry `retry`, with jitter.
    #[must_use]
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let capped = self.capped_delay(retry);
        if capped.is_zero() || self.jitter_factor <= 0.0 {
            return capped;
        }

        let extra = rand::rng().random_range(0.0..=capped.as_secs_f64() * self.jitter_factor);
        capped + Duration::try_from_secs_f64(extra).unwrap_or_default()
    }

    /// Retries allowed per cycle.
    #[must_use]
    pub fn retry_limit(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// One reconnect cycle: yields the wait before each retry, then `None`
/// once the limit is spent.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    retries: u32,
}

impl Backoff {
    /// Fresh cycle.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// Start a new cycle, typically after a session was established.
    pub const fn restart(&mut self) {
        self.retries = 0;
    }

    /// Retries handed out in this cycle.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub fn has_budget(&self) -> bool {
        self.retries < self.config.retry_limit()
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.has_budget().then(|| {
            let delay = self.config.jittered_delay(self.retries);
            self.retries += 1;
            delay
        })
    }
}
