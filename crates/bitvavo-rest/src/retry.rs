//! Retry policy for transient failures

use bitvavo_types::Backoff;
use std::time::Duration;

/// How many times network and transient server errors are retried
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay schedule by retry number
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(5)).with_jitter(0.1),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt limit
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the first delay
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.backoff.initial = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.backoff.max = delay;
        self
    }

    /// Set jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff = self.backoff.with_jitter(jitter);
        self
    }

    /// Never retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Check if another attempt is allowed after `attempts_made`
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before retry number `retry`, with jitter applied
    pub fn backoff_with_jitter(&self, retry: u32) -> Duration {
        self.backoff.jittered(retry)
    }
}
