//! Time source abstraction
//!
//! Every wait in the rate limiter and the retry loop goes through a
//! [`Clock`], so tests can drive time by hand with [`MockClock`].

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Source of local wall-clock time in epoch milliseconds
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current local time (epoch ms)
    fn now_ms(&self) -> i64;

    /// Wait until local time reaches `deadline_ms`
    async fn sleep_until(&self, deadline_ms: i64);
}

/// Wall clock backed by the system time and tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn sleep_until(&self, deadline_ms: i64) {
        let remaining = deadline_ms - self.now_ms();
        if remaining > 0 {
            tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
        }
    }
}

/// Manually driven clock for deterministic tests
///
/// Time only moves through [`advance`](MockClock::advance) and
/// [`set`](MockClock::set); both wake every pending `sleep_until`.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct MockClock {
    now: tokio::sync::watch::Sender<i64>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockClock {
    /// Create a clock frozen at `start_ms`
    pub fn new(start_ms: i64) -> Self {
        let (now, _) = tokio::sync::watch::channel(start_ms);
        Self { now }
    }

    /// Move time forward
    pub fn advance(&self, ms: i64) {
        self.now.send_modify(|now| *now += ms);
    }

    /// Jump to an absolute time
    pub fn set(&self, ms: i64) {
        self.now.send_replace(ms);
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Clock for MockClock {
    fn now_ms(&self) -> i64 {
        *self.now.borrow()
    }

    async fn sleep_until(&self, deadline_ms: i64) {
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline_ms {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
