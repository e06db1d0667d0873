//! Reconnect policy

use bitvavo_types::Backoff;
use std::time::Duration;

/// When and how often to reconnect after a dropped socket
///
/// Also paces snapshot refetches in the orderbook synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay schedule by consecutive failure
    pub backoff: Backoff,
    /// Consecutive failures tolerated (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30)),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.backoff.initial = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.backoff.max = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff = self.backoff.with_multiplier(multiplier);
        self
    }

    /// Set jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff = self.backoff.with_jitter(jitter);
        self
    }

    /// Limit consecutive failures
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Give up on the first failure
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    /// Jittered delay before attempt `attempt`
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        self.backoff.jittered(attempt)
    }

    /// Check if attempt `attempt` may be made
    pub fn should_reconnect(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_shape_backoff() {
        let config = ReconnectConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(0.0);

        assert_eq!(config.delay_with_jitter(1), Duration::from_millis(100));
        assert_eq!(config.delay_with_jitter(4), Duration::from_millis(800));
        assert_eq!(config.delay_with_jitter(5), Duration::from_secs(1));
    }

    #[test]
    fn test_attempt_limits() {
        assert!(ReconnectConfig::default().should_reconnect(1_000));

        let limited = ReconnectConfig::default().with_max_attempts(3);
        assert!(limited.should_reconnect(1));
        assert!(limited.should_reconnect(3));
        assert!(!limited.should_reconnect(4));

        assert!(!ReconnectConfig::disabled().should_reconnect(1));
    }
}
