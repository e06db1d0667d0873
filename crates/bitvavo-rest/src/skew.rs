//! Clock skew estimation
//!
//! Each sample assumes the server read its clock halfway through the round
//! trip: `offset = (sent + rtt / 2) - server_time`. The estimate is the
//! median of the samples, so a single slow round trip cannot drag it.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::error::RestResult;

/// Anything that can report the server's current time
#[async_trait]
pub trait ServerTimeSource: Send + Sync {
    /// Server time in epoch ms
    async fn server_time_ms(&self) -> RestResult<i64>;
}

/// Skew estimation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkewConfig {
    /// Round trips per estimate
    pub samples: usize,
    /// Offset reported before the first successful estimate
    pub default_offset_ms: i64,
}

impl Default for SkewConfig {
    fn default() -> Self {
        Self {
            samples: 5,
            default_offset_ms: 0,
        }
    }
}

impl SkewConfig {
    /// Set the number of samples
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    /// Set the initial offset
    pub fn with_default_offset(mut self, offset_ms: i64) -> Self {
        self.default_offset_ms = offset_ms;
        self
    }
}

/// Median-of-samples estimator of `local - server` in milliseconds
#[derive(Debug)]
pub struct ClockSkewEstimator {
    config: SkewConfig,
    clock: Arc<dyn Clock>,
    last: AtomicI64,
}

impl ClockSkewEstimator {
    /// Create an estimator
    pub fn new(config: SkewConfig, clock: Arc<dyn Clock>) -> Self {
        let last = AtomicI64::new(config.default_offset_ms);
        Self {
            config,
            clock,
            last,
        }
    }

    /// Most recent estimate (or the configured default)
    pub fn last_estimate(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    /// Measure the offset against `source`
    ///
    /// Failed samples are skipped. If every sample fails the previous
    /// estimate is returned unchanged.
    #[instrument(skip(self, source))]
    pub async fn estimate(&self, source: &dyn ServerTimeSource) -> i64 {
        let mut offsets = Vec::with_capacity(self.config.samples);

        for sample in 0..self.config.samples {
            let sent = self.clock.now_ms();
            match source.server_time_ms().await {
                Ok(server) => {
                    let received = self.clock.now_ms();
                    let rtt = (received - sent).max(0);
                    offsets.push(sent + rtt / 2 - server);
                }
                Err(e) => {
                    warn!(sample, error = %e, "Server time sample failed");
                }
            }
        }

        if offsets.is_empty() {
            let previous = self.last_estimate();
            warn!(offset_ms = previous, "No usable samples, keeping previous offset");
            return previous;
        }

        let offset = median(&mut offsets);
        self.last.store(offset, Ordering::Release);
        debug!(offset_ms = offset, samples = offsets.len(), "Clock offset estimated");
        offset
    }
}

fn median(values: &mut [i64]) -> i64 {
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::error::RestError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays (server_time, round_trip_ms) pairs, advancing the mock clock
    struct ScriptedSource {
        clock: Arc<MockClock>,
        samples: Mutex<VecDeque<RestResult<(i64, i64)>>>,
    }

    #[async_trait]
    impl ServerTimeSource for ScriptedSource {
        async fn server_time_ms(&self) -> RestResult<i64> {
            let next = self
                .samples
                .lock()
                .pop_front()
                .unwrap_or(Err(RestError::Network("exhausted".into())));
            let (server, rtt) = next?;
            self.clock.advance(rtt);
            Ok(server)
        }
    }

    fn source(clock: &Arc<MockClock>, samples: Vec<RestResult<(i64, i64)>>) -> ScriptedSource {
        ScriptedSource {
            clock: Arc::clone(clock),
            samples: Mutex::new(samples.into()),
        }
    }

    #[tokio::test]
    async fn test_median_ignores_outlier() {
        let clock = Arc::new(MockClock::new(10_000));
        let estimator = ClockSkewEstimator::new(SkewConfig::default(), clock.clone());

        // Local runs 100ms ahead; one sample has a 4s round trip
        let now = 10_000;
        let src = source(
            &clock,
            vec![
                Ok((now + 10 - 100, 20)),
                Ok((now + 30 - 100, 20)),
                Ok((now + 50 - 100, 4_000)),
                Ok((now + 4_050 - 100, 20)),
                Ok((now + 4_070 - 100, 20)),
            ],
        );

        assert_eq!(estimator.estimate(&src).await, 100);
        assert_eq!(estimator.last_estimate(), 100);
    }

    #[tokio::test]
    async fn test_failures_keep_previous_estimate() {
        let clock = Arc::new(MockClock::new(0));
        let config = SkewConfig::default().with_samples(3).with_default_offset(25);
        let estimator = ClockSkewEstimator::new(config, clock.clone());

        let src = source(&clock, vec![]);
        assert_eq!(estimator.estimate(&src).await, 25);
    }

    #[tokio::test]
    async fn test_partial_failure_uses_remaining_samples() {
        let clock = Arc::new(MockClock::new(0));
        let config = SkewConfig::default().with_samples(3);
        let estimator = ClockSkewEstimator::new(config, clock.clone());

        let src = source(
            &clock,
            vec![
                Err(RestError::Network("timeout".into())),
                Ok((-40, 0)),
                Ok((-40, 0)),
            ],
        );
        assert_eq!(estimator.estimate(&src).await, 40);
    }

    #[test]
    fn test_median_even() {
        assert_eq!(median(&mut [4, 1, 3, 2]), 2);
        assert_eq!(median(&mut [7]), 7);
    }
}
