//! Exponential backoff shared by REST retries, stream reconnects and snapshot refetches

use std::time::Duration;

/// Exponential, capped, jittered delay schedule
///
/// Attempt 1 waits `initial`, each further attempt multiplies the delay by
/// `multiplier` up to `max`. Jitter spreads the result by up to `jitter`
/// of itself in either direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Growth factor per attempt (at least 1.0)
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Backoff {
    /// Doubling schedule from `initial` to `max` with 20% jitter
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Set the growth factor
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before attempt `attempt` (1-indexed), without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay before attempt `attempt`, jittered
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        if self.jitter == 0.0 {
            return base;
        }
        let range = base.as_millis() as f64 * self.jitter;
        let offset = rand::random::<f64>() * 2.0 * range - range;
        Duration::from_millis((base.as_millis() as f64 + offset).max(0.0) as u64)
    }
}
