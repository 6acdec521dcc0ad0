//! Exponential reconnect backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Lower bound of the per-wait jitter fraction.
pub const JITTER_MIN: f64 = 0.1;
/// Upper bound of the per-wait jitter fraction.
pub const JITTER_MAX: f64 = 0.5;

/// Static backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor applied after every failed attempt
    pub multiplier: f64,
    /// Upper bound for the un-jittered delay
    pub max_delay: Duration,
    /// Consecutive failed connects before giving up
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Mutable backoff state for one managed link.
///
/// `delay()` is non-decreasing across consecutive failures and never exceeds
/// `max_delay`; `reset()` returns to the initial state after a successful connect.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    attempt: u32,
    delay: Duration,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        let delay = config.initial_delay.min(config.max_delay);
        Self {
            config,
            attempt: 0,
            delay,
        }
    }

    /// Failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The current un-jittered delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `true` once `max_attempts` consecutive failures have been recorded.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }

    /// Record a failed attempt: bump the counter and grow the delay.
    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
        let grown = self.delay.as_nanos() as f64 * self.config.multiplier.max(1.0);
        let cap = self.config.max_delay.as_nanos() as f64;
        self.delay = if grown.is_finite() && grown < cap {
            Duration::from_nanos(grown as u64)
        } else {
            self.config.max_delay
        };
    }

    /// Back to attempt 0 and the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay.min(self.config.max_delay);
    }

    /// The current delay plus a random `[JITTER_MIN, JITTER_MAX]` fraction of it.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        jitter(self.delay, rng.gen_range(JITTER_MIN..=JITTER_MAX))
    }
}

/// `delay + fraction × delay`.
pub fn jitter(delay: Duration, fraction: f64) -> Duration {
    delay + delay.mul_f64(fraction.clamp(0.0, JITTER_MAX))
}
