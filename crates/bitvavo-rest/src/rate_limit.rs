//! Per-credential weight budgets
//!
//! Bitvavo charges every request a weight against a budget that resets at a
//! server-declared time. Each API key has its own budget and unauthenticated
//! traffic has one more (the keyless pseudo-credential).
//!
//! The local estimate is a lower bound used to avoid sending when a budget is
//! certainly empty. Values from the `bitvavo-ratelimit-remaining` and
//! `bitvavo-ratelimit-resetat` response headers always overwrite it.
//!
//! # Time
//!
//! Reset and ban timestamps are server time. They are converted to local
//! time with the clock offset (`local = server + offset`, offset positive
//! when the local clock is ahead) before anything waits on them.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bitvavo_types::{ApiError, ErrorClass, BAN_FALLBACK_MS, RATE_LIMIT_FALLBACK_MS};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{RestError, RestResult};

/// Response header with the remaining budget
pub const REMAINING_HEADER: &str = "bitvavo-ratelimit-remaining";
/// Response header with the budget reset time (server epoch ms)
pub const RESET_AT_HEADER: &str = "bitvavo-ratelimit-resetat";

/// Default budget for a credential the server has not reported on yet
pub const DEFAULT_BUDGET: u32 = 1000;

/// Identifies a budget holder
///
/// Ordering puts `Keyless` before every key, then keys by index; ties in
/// credential selection go to the smaller id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CredentialId {
    /// Unauthenticated access
    Keyless,
    /// API key by configuration index
    Key(usize),
}

impl CredentialId {
    /// Returns true for the keyless pseudo-credential
    pub fn is_keyless(&self) -> bool {
        matches!(self, Self::Keyless)
    }
}

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyless => f.write_str("keyless"),
            Self::Key(index) => write!(f, "key#{}", index),
        }
    }
}

/// Budget state of one credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBudget {
    /// Remaining weight (never negative)
    pub remaining: u32,
    /// When the budget resets (server epoch ms), if known
    pub reset_at_ms: Option<i64>,
    /// Ban expiry (server epoch ms), if banned
    pub banned_until_ms: Option<i64>,
}

impl CredentialBudget {
    /// Fresh budget
    pub fn new(remaining: u32) -> Self {
        Self {
            remaining,
            reset_at_ms: None,
            banned_until_ms: None,
        }
    }

    /// Check if the credential is banned
    pub fn is_banned(&self) -> bool {
        self.banned_until_ms.is_some()
    }

    /// Check if `weight` can be spent without dipping into the buffer
    pub fn has_budget(&self, weight: u32, buffer: u32) -> bool {
        !self.is_banned() && self.remaining >= weight.saturating_add(buffer)
    }

    /// Spend `weight`, opening a fallback reset window if the server has not reported one
    fn charge(&mut self, weight: u32, server_now_ms: i64) {
        self.remaining = self.remaining.saturating_sub(weight);
        self.open_window(server_now_ms);
    }

    fn open_window(&mut self, server_now_ms: i64) {
        if self.reset_at_ms.is_none() {
            self.reset_at_ms = Some(server_now_ms + RATE_LIMIT_FALLBACK_MS);
        }
    }

    /// Clear expired bans and resets
    fn refresh(&mut self, server_now_ms: i64, default_budget: u32) {
        if let Some(until) = self.banned_until_ms {
            if server_now_ms >= until {
                *self = Self::new(default_budget);
                return;
            }
        }
        if let Some(reset_at) = self.reset_at_ms {
            if server_now_ms >= reset_at {
                self.remaining = default_budget;
                self.reset_at_ms = None;
            }
        }
    }
}

/// Throttling signal carried by a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// Budget exhausted (103/104 or HTTP 429)
    RateLimited,
    /// Temporary ban (105)
    Banned {
        /// Ban expiry from the error message (server epoch ms)
        until_ms: Option<i64>,
    },
}

impl Throttle {
    /// Classify an HTTP status and optional error body
    pub fn classify(status: u16, error: Option<&ApiError>) -> Option<Self> {
        match error.map(ApiError::class) {
            Some(ErrorClass::RateLimited) => Some(Self::RateLimited),
            Some(ErrorClass::Banned) => Some(Self::Banned {
                until_ms: error.and_then(ApiError::ban_expiry_ms),
            }),
            Some(_) => None,
            None if status == 429 => Some(Self::RateLimited),
            None => None,
        }
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Budget assumed for credentials the server has not reported on
    pub default_budget: u32,
    /// Safety margin kept untouched in every budget
    pub buffer: u32,
    /// Use keyless access for public requests when it has budget
    pub prefer_keyless: bool,
    /// Fixed clock offset (ms) replacing the estimate
    pub lag_override_ms: Option<i64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_budget: DEFAULT_BUDGET,
            buffer: 0,
            prefer_keyless: false,
            lag_override_ms: None,
        }
    }
}

impl RateLimitConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default budget
    pub fn with_default_budget(mut self, budget: u32) -> Self {
        self.default_budget = budget;
        self
    }

    /// Set the safety buffer
    pub fn with_buffer(mut self, buffer: u32) -> Self {
        self.buffer = buffer;
        self
    }

    /// Prefer keyless access for public requests
    pub fn with_prefer_keyless(mut self, prefer: bool) -> Self {
        self.prefer_keyless = prefer;
        self
    }

    /// Pin the clock offset
    pub fn with_lag_override(mut self, offset_ms: i64) -> Self {
        self.lag_override_ms = Some(offset_ms);
        self
    }
}

/// Result of one selection pass
enum Selection {
    Granted(CredentialId),
    /// Nothing eligible; re-evaluate at this local time (or on any release)
    Wait { until_local_ms: i64, banned: bool },
}

/// Selects credentials for requests and keeps their budgets honest
///
/// Safe to share between tasks. `acquire` only blocks its caller; requests
/// that can use another credential keep flowing.
pub struct RateLimitManager {
    config: RateLimitConfig,
    budgets: Mutex<BTreeMap<CredentialId, CredentialBudget>>,
    /// Signalled whenever a budget changes
    changed: Notify,
    offset_ms: AtomicI64,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl fmt::Debug for RateLimitManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitManager")
            .field("config", &self.config)
            .field("budgets", &*self.budgets.lock())
            .field("offset_ms", &self.clock_offset())
            .finish()
    }
}

impl RateLimitManager {
    /// Create a manager for `key_count` API keys plus keyless access
    pub fn new(config: RateLimitConfig, key_count: usize, clock: Arc<dyn Clock>) -> Self {
        let mut budgets = BTreeMap::new();
        budgets.insert(
            CredentialId::Keyless,
            CredentialBudget::new(config.default_budget),
        );
        for index in 0..key_count {
            budgets.insert(
                CredentialId::Key(index),
                CredentialBudget::new(config.default_budget),
            );
        }

        Self {
            config,
            budgets: Mutex::new(budgets),
            changed: Notify::new(),
            offset_ms: AtomicI64::new(0),
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Get the clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of API keys managed
    pub fn key_count(&self) -> usize {
        self.budgets
            .lock()
            .keys()
            .filter(|id| !id.is_keyless())
            .count()
    }

    /// Add a key; its budget starts at the default
    pub fn register_key(&self) -> CredentialId {
        let mut budgets = self.budgets.lock();
        let next = budgets.keys().filter(|id| !id.is_keyless()).count();
        let id = CredentialId::Key(next);
        budgets.insert(id, CredentialBudget::new(self.config.default_budget));
        info!(credential = %id, "Registered credential");
        id
    }

    /// Current clock offset (ms, positive when local is ahead)
    pub fn clock_offset(&self) -> i64 {
        self.config
            .lag_override_ms
            .unwrap_or_else(|| self.offset_ms.load(Ordering::Acquire))
    }

    /// Store a new offset estimate
    ///
    /// Ignored while a lag override is configured.
    pub fn set_clock_offset(&self, offset_ms: i64) {
        if self.config.lag_override_ms.is_some() {
            debug!(offset_ms, "Lag override active, ignoring estimate");
            return;
        }
        self.offset_ms.store(offset_ms, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// Local time expressed as server time
    pub fn server_now_ms(&self) -> i64 {
        self.clock.now_ms() - self.clock_offset()
    }

    /// Snapshot of one credential's budget
    pub fn budget(&self, id: CredentialId) -> Option<CredentialBudget> {
        self.budgets.lock().get(&id).cloned()
    }

    /// Snapshot of all budgets
    pub fn budgets(&self) -> Vec<(CredentialId, CredentialBudget)> {
        self.budgets
            .lock()
            .iter()
            .map(|(id, budget)| (*id, budget.clone()))
            .collect()
    }

    /// Restore a credential to the default budget and lift any ban
    pub fn reset_credential(&self, id: CredentialId) {
        self.budgets
            .lock()
            .insert(id, CredentialBudget::new(self.config.default_budget));
        info!(credential = %id, "Credential budget reset");
        self.changed.notify_waiters();
    }

    /// Wake every blocked `acquire` with [`RestError::ShuttingDown`]
    pub fn shutdown(&self) {
        info!("Rate limit manager shutdown requested");
        self.shutdown.cancel();
        self.changed.notify_waiters();
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled on shutdown
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Select a credential for a request of `weight`, waiting if none has budget
    ///
    /// Among eligible credentials the one with the most remaining budget wins;
    /// ties go to the lowest id. The weight is charged to the local estimate
    /// immediately.
    #[instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, weight: u32, requires_auth: bool) -> RestResult<CredentialId> {
        self.validate(weight, requires_auth)?;

        loop {
            if self.is_shutdown() {
                return Err(RestError::ShuttingDown);
            }

            // Register for change notifications before looking at state,
            // so a release between the check and the wait is not missed.
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();

            let (until_local_ms, banned) = match self.select(weight, requires_auth) {
                Selection::Granted(id) => {
                    debug!(credential = %id, weight, "Budget acquired");
                    return Ok(id);
                }
                Selection::Wait {
                    until_local_ms,
                    banned,
                } => (until_local_ms, banned),
            };

            let wait_ms = until_local_ms - self.clock.now_ms();
            if banned {
                warn!(wait_ms, "All candidate credentials banned, waiting");
            } else {
                debug!(wait_ms, weight, "No credential has budget, waiting for reset");
            }

            tokio::select! {
                () = self.clock.sleep_until(until_local_ms) => {}
                () = notified => {}
                () = self.shutdown.cancelled() => return Err(RestError::ShuttingDown),
            }
        }
    }

    /// Reconcile a credential with the outcome of a request
    ///
    /// `headers` is `None` when no response arrived. Header values overwrite
    /// the local estimate; `throttle` marks the budget exhausted or banned.
    pub fn release(&self, id: CredentialId, headers: Option<&HeaderMap>, throttle: Option<Throttle>) {
        let server_now = self.server_now_ms();
        {
            let mut budgets = self.budgets.lock();
            let budget = budgets
                .entry(id)
                .or_insert_with(|| CredentialBudget::new(self.config.default_budget));

            let mut reset_reported = false;
            if let Some(headers) = headers {
                if let Some(remaining) = header_value(headers, REMAINING_HEADER) {
                    budget.remaining = remaining.clamp(0, i64::from(u32::MAX)) as u32;
                }
                if let Some(reset_at) = header_value(headers, RESET_AT_HEADER) {
                    budget.reset_at_ms = Some(reset_at);
                    reset_reported = true;
                }
            }
            if budget.remaining < self.config.default_budget {
                budget.open_window(server_now);
            }

            match throttle {
                Some(Throttle::RateLimited) => {
                    budget.remaining = 0;
                    if !reset_reported {
                        budget.reset_at_ms = Some(server_now + RATE_LIMIT_FALLBACK_MS);
                    }
                    warn!(credential = %id, reset_at_ms = ?budget.reset_at_ms, "Rate limited by server");
                }
                Some(Throttle::Banned { until_ms }) => {
                    let until = until_ms.unwrap_or(server_now + BAN_FALLBACK_MS);
                    budget.remaining = 0;
                    budget.banned_until_ms = Some(until);
                    let resume_at = chrono::DateTime::from_timestamp_millis(until)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default();
                    warn!(credential = %id, until_ms = until, %resume_at, "Credential banned");
                }
                None => {}
            }
        }
        self.changed.notify_waiters();
    }

    fn validate(&self, weight: u32, requires_auth: bool) -> RestResult<()> {
        if weight.saturating_add(self.config.buffer) > self.config.default_budget {
            return Err(RestError::Configuration(format!(
                "weight {} plus buffer {} exceeds budget {}",
                weight, self.config.buffer, self.config.default_budget
            )));
        }
        if requires_auth && self.key_count() == 0 {
            return Err(RestError::Configuration(
                "authenticated request but no API keys configured".into(),
            ));
        }
        Ok(())
    }

    fn select(&self, weight: u32, requires_auth: bool) -> Selection {
        let offset = self.clock_offset();
        let local_now = self.clock.now_ms();
        let server_now = local_now - offset;
        let buffer = self.config.buffer;

        let mut budgets = self.budgets.lock();
        for budget in budgets.values_mut() {
            budget.refresh(server_now, self.config.default_budget);
        }

        let has_keys = budgets.keys().any(|id| !id.is_keyless());
        let keyless_ok = budgets
            .get(&CredentialId::Keyless)
            .is_some_and(|b| b.has_budget(weight, buffer));

        let eligible = |id: &CredentialId| -> bool {
            match (id, requires_auth) {
                (CredentialId::Key(_), _) => true,
                (CredentialId::Keyless, true) => false,
                (CredentialId::Keyless, false) => !has_keys || self.config.prefer_keyless,
            }
        };

        let chosen = if !requires_auth && self.config.prefer_keyless && keyless_ok {
            Some(CredentialId::Keyless)
        } else {
            let mut best: Option<(CredentialId, u32)> = None;
            for (id, budget) in budgets.iter() {
                if !eligible(id) || !budget.has_budget(weight, buffer) {
                    continue;
                }
                // BTreeMap order is ascending, so strictly-greater keeps the lowest id on ties
                if best.map_or(true, |(_, remaining)| budget.remaining > remaining) {
                    best = Some((*id, budget.remaining));
                }
            }
            best.map(|(id, _)| id)
        };

        if let Some(id) = chosen {
            if let Some(budget) = budgets.get_mut(&id) {
                budget.charge(weight, server_now);
            }
            return Selection::Granted(id);
        }

        let candidates: Vec<&CredentialBudget> = budgets
            .iter()
            .filter(|(id, _)| eligible(id))
            .map(|(_, budget)| budget)
            .collect();

        let next_reset = candidates
            .iter()
            .filter(|b| !b.is_banned())
            .map(|b| b.reset_at_ms.unwrap_or(server_now + RATE_LIMIT_FALLBACK_MS))
            .min();

        match next_reset {
            Some(reset_at) => Selection::Wait {
                until_local_ms: reset_at + offset,
                banned: false,
            },
            None => {
                let ban_end = candidates
                    .iter()
                    .filter_map(|b| b.banned_until_ms)
                    .min()
                    .unwrap_or(server_now + BAN_FALLBACK_MS);
                Selection::Wait {
                    until_local_ms: ban_end + offset,
                    banned: true,
                }
            }
        }
    }
}

/// Read an integer header, ignoring (with a warning) values that do not parse
fn header_value(headers: &HeaderMap, name: &str) -> Option<i64> {
    let value = headers.get(name)?;
    match value.to_str().ok().and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(parsed) => Some(parsed),
        None => {
            warn!(header = name, value = ?value, "Ignoring unparsable rate limit header");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use reqwest::header::{HeaderName, HeaderValue};

    const START: i64 = 1_700_000_000_000;

    fn setup(config: RateLimitConfig, keys: usize) -> (Arc<RateLimitManager>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(START));
        let manager = Arc::new(RateLimitManager::new(config, keys, clock.clone()));
        (manager, clock)
    }

    fn headers(remaining: &str, reset_at: Option<i64>) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_static(REMAINING_HEADER),
            HeaderValue::from_str(remaining).unwrap(),
        );
        if let Some(reset_at) = reset_at {
            map.insert(
                HeaderName::from_static(RESET_AT_HEADER),
                HeaderValue::from_str(&reset_at.to_string()).unwrap(),
            );
        }
        map
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_credential_ordering() {
        assert!(CredentialId::Keyless < CredentialId::Key(0));
        assert!(CredentialId::Key(0) < CredentialId::Key(1));
        assert_eq!(CredentialId::Key(2).to_string(), "key#2");
    }

    #[test]
    fn test_throttle_classification() {
        assert_eq!(Throttle::classify(429, None), Some(Throttle::RateLimited));
        assert_eq!(
            Throttle::classify(403, Some(&ApiError::new(104, "limit"))),
            Some(Throttle::RateLimited)
        );
        assert_eq!(
            Throttle::classify(403, Some(&ApiError::new(105, "The ban expires at 1700000002000"))),
            Some(Throttle::Banned {
                until_ms: Some(1_700_000_002_000)
            })
        );
        assert_eq!(Throttle::classify(400, Some(&ApiError::new(205, "bad"))), None);
        assert_eq!(Throttle::classify(200, None), None);
    }

    #[tokio::test]
    async fn test_within_budget_never_blocks() {
        let config = RateLimitConfig::new().with_default_budget(100);
        let (manager, _clock) = setup(config, 3);

        // 3 keys x 100 weight: 30 calls of weight 10 fit without any reset
        for _ in 0..30 {
            manager.acquire(10, true).await.unwrap();
        }
        for index in 0..3 {
            assert_eq!(manager.budget(CredentialId::Key(index)).unwrap().remaining, 0);
        }
    }

    #[tokio::test]
    async fn test_selects_greatest_remaining_then_lowest_index() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 3);

        manager.release(CredentialId::Key(0), Some(&headers("500", None)), None);
        manager.release(CredentialId::Key(1), Some(&headers("900", None)), None);
        manager.release(CredentialId::Key(2), Some(&headers("900", None)), None);

        assert_eq!(manager.acquire(1, true).await.unwrap(), CredentialId::Key(1));
        assert_eq!(manager.acquire(1, true).await.unwrap(), CredentialId::Key(2));
        assert_eq!(manager.acquire(1, true).await.unwrap(), CredentialId::Key(1));
    }

    #[tokio::test]
    async fn test_keyless_only_without_keys() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 0);
        assert_eq!(manager.acquire(1, false).await.unwrap(), CredentialId::Keyless);
        assert!(matches!(
            manager.acquire(1, true).await,
            Err(RestError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_keys_preferred_unless_prefer_keyless() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        assert_eq!(manager.acquire(1, false).await.unwrap(), CredentialId::Key(0));

        let config = RateLimitConfig::new().with_prefer_keyless(true);
        let (manager, _clock) = setup(config, 1);
        assert_eq!(manager.acquire(1, false).await.unwrap(), CredentialId::Keyless);
        assert_eq!(manager.acquire(1, true).await.unwrap(), CredentialId::Key(0));
    }

    #[tokio::test]
    async fn test_prefer_keyless_falls_back_to_keys() {
        let config = RateLimitConfig::new().with_prefer_keyless(true);
        let (manager, _clock) = setup(config, 1);
        manager.release(CredentialId::Keyless, Some(&headers("0", Some(START + 60_000))), None);

        assert_eq!(manager.acquire(5, false).await.unwrap(), CredentialId::Key(0));
    }

    #[tokio::test]
    async fn test_weight_exceeding_budget_is_configuration_error() {
        let config = RateLimitConfig::new().with_default_budget(100).with_buffer(10);
        let (manager, _clock) = setup(config, 1);
        assert!(matches!(
            manager.acquire(95, true).await,
            Err(RestError::Configuration(_))
        ));
        assert!(manager.acquire(90, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_local_decrement_saturates() {
        let config = RateLimitConfig::new().with_default_budget(10);
        let (manager, _clock) = setup(config, 1);
        manager.release(CredentialId::Key(0), Some(&headers("3", Some(START + 1_000))), None);

        // Server says 3 left; a weight-3 call may spend exactly that
        manager.acquire(3, true).await.unwrap();
        assert_eq!(manager.budget(CredentialId::Key(0)).unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_server_headers_overwrite_estimate() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        manager.acquire(100, true).await.unwrap();
        assert_eq!(manager.budget(CredentialId::Key(0)).unwrap().remaining, 900);

        manager.release(CredentialId::Key(0), Some(&headers("990", Some(START + 5_000))), None);
        let budget = manager.budget(CredentialId::Key(0)).unwrap();
        assert_eq!(budget.remaining, 990);
        assert_eq!(budget.reset_at_ms, Some(START + 5_000));
    }

    #[tokio::test]
    async fn test_headers_matched_case_insensitively() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_bytes(b"Bitvavo-RateLimit-Remaining").unwrap(),
            HeaderValue::from_static("42"),
        );
        manager.release(CredentialId::Key(0), Some(&map), None);
        assert_eq!(manager.budget(CredentialId::Key(0)).unwrap().remaining, 42);
    }

    #[tokio::test]
    async fn test_unparsable_header_ignored() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        manager.release(CredentialId::Key(0), Some(&headers("lots", None)), None);
        assert_eq!(manager.budget(CredentialId::Key(0)).unwrap().remaining, 1000);
    }

    #[tokio::test]
    async fn test_reset_wait_honours_clock_offset() {
        let (manager, clock) = setup(RateLimitConfig::default(), 1);
        manager.set_clock_offset(50);
        manager.release(CredentialId::Key(0), Some(&headers("0", Some(START + 5_000))), None);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(1, true).await })
        };

        settle().await;
        clock.set(START + 4_950);
        settle().await;
        assert!(!task.is_finished());

        clock.set(START + 5_049);
        settle().await;
        assert!(!task.is_finished());

        clock.set(START + 5_050);
        assert_eq!(task.await.unwrap().unwrap(), CredentialId::Key(0));
        assert_eq!(manager.budget(CredentialId::Key(0)).unwrap().remaining, 999);
    }

    #[tokio::test]
    async fn test_ban_avoids_credential_while_other_is_granted() {
        let (manager, clock) = setup(RateLimitConfig::default(), 2);
        manager.release(
            CredentialId::Key(0),
            None,
            Some(Throttle::Banned {
                until_ms: Some(START + 2_000),
            }),
        );

        for _ in 0..5 {
            assert_eq!(manager.acquire(1, true).await.unwrap(), CredentialId::Key(1));
        }

        clock.set(START + 2_000);
        // Key 0 is back with a full budget and now has more than key 1
        assert_eq!(manager.acquire(1, true).await.unwrap(), CredentialId::Key(0));
        assert!(!manager.budget(CredentialId::Key(0)).unwrap().is_banned());
    }

    #[tokio::test]
    async fn test_all_banned_waits_for_earliest_ban() {
        let (manager, clock) = setup(RateLimitConfig::default(), 2);
        manager.release(CredentialId::Key(0), None, Some(Throttle::Banned { until_ms: Some(START + 3_000) }));
        manager.release(CredentialId::Key(1), None, Some(Throttle::Banned { until_ms: Some(START + 2_000) }));

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(1, true).await })
        };

        settle().await;
        clock.set(START + 1_999);
        settle().await;
        assert!(!task.is_finished());

        clock.set(START + 2_000);
        assert_eq!(task.await.unwrap().unwrap(), CredentialId::Key(1));
    }

    #[tokio::test]
    async fn test_rate_limited_without_reset_uses_fallback() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        manager.release(CredentialId::Key(0), None, Some(Throttle::RateLimited));
        let budget = manager.budget(CredentialId::Key(0)).unwrap();
        assert_eq!(budget.remaining, 0);
        assert_eq!(budget.reset_at_ms, Some(START + RATE_LIMIT_FALLBACK_MS));
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        manager.release(CredentialId::Key(0), Some(&headers("0", Some(START + 60_000))), None);

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(1, true).await })
        };
        settle().await;
        assert!(!task.is_finished());

        manager.release(CredentialId::Key(0), Some(&headers("500", Some(START + 60_000))), None);
        assert_eq!(task.await.unwrap().unwrap(), CredentialId::Key(0));
    }

    #[tokio::test]
    async fn test_locally_spent_budget_restores_after_fallback_window() {
        let config = RateLimitConfig::new().with_default_budget(3);
        let (manager, clock) = setup(config, 1);

        // Network failures: no headers, so no server reset time is ever learned
        for _ in 0..3 {
            let id = manager.acquire(1, true).await.unwrap();
            manager.release(id, None, None);
        }
        let budget = manager.budget(CredentialId::Key(0)).unwrap();
        assert_eq!(budget.remaining, 0);
        assert_eq!(budget.reset_at_ms, Some(START + RATE_LIMIT_FALLBACK_MS));

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(1, true).await })
        };
        settle().await;
        clock.set(START + RATE_LIMIT_FALLBACK_MS - 1);
        settle().await;
        assert!(!task.is_finished());

        clock.set(START + RATE_LIMIT_FALLBACK_MS);
        assert_eq!(task.await.unwrap().unwrap(), CredentialId::Key(0));
        assert_eq!(manager.budget(CredentialId::Key(0)).unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn test_exhausting_header_without_reset_opens_window() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        manager.release(CredentialId::Key(0), Some(&headers("0", None)), None);
        let budget = manager.budget(CredentialId::Key(0)).unwrap();
        assert_eq!(budget.reset_at_ms, Some(START + RATE_LIMIT_FALLBACK_MS));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_acquire() {
        let (manager, _clock) = setup(RateLimitConfig::default(), 1);
        manager.release(CredentialId::Key(0), None, Some(Throttle::Banned { until_ms: None }));

        let task = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(1, true).await })
        };
        settle().await;

        manager.shutdown();
        assert_eq!(task.await.unwrap(), Err(RestError::ShuttingDown));
        assert_eq!(manager.acquire(1, true).await, Err(RestError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_register_and_reset_credential() {
        let (manager, _clock) = setup(RateLimitConfig::default().with_default_budget(50), 1);
        let id = manager.register_key();
        assert_eq!(id, CredentialId::Key(1));
        assert_eq!(manager.budget(id).unwrap().remaining, 50);
        assert_eq!(manager.key_count(), 2);

        manager.release(id, None, Some(Throttle::Banned { until_ms: None }));
        assert!(manager.budget(id).unwrap().is_banned());
        manager.reset_credential(id);
        assert_eq!(manager.budget(id).unwrap(), CredentialBudget::new(50));
        assert_eq!(manager.budgets().len(), 3);
    }

    #[tokio::test]
    async fn test_lag_override_wins() {
        let config = RateLimitConfig::new().with_lag_override(-200);
        let (manager, _clock) = setup(config, 0);
        manager.set_clock_offset(75);
        assert_eq!(manager.clock_offset(), -200);
        assert_eq!(manager.server_now_ms(), START + 200);
    }
}
