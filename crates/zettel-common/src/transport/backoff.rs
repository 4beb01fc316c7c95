//! Exponential reconnect backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect delay policy: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_ms: u64,
    /// Randomize each delay into `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            multiplier: 2.0,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            multiplier,
            max_ms: max.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay before retry number `attempt`, with jitter applied if enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let ms = base.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
    }
}
