//! Client configuration
//!
//! One struct carries every setting the client needs and hands out the
//! smaller per-crate configs. Values can be set with the `with_*` builder
//! methods or read from `BITVAVO_*` environment variables.
//!
//! # Example
//!
//! ```
//! use bitvavo_sdk::ClientConfig;
//! use std::time::Duration;
//!
//! let config = ClientConfig::new()
//!     .with_prefer_keyless(true)
//!     .with_default_budget(1000)
//!     .with_budget_buffer(50)
//!     .with_heartbeat_timeout(Some(Duration::from_secs(30)));
//! assert!(config.validate().is_ok());
//! ```

use std::str::FromStr;
use std::time::Duration;

use bitvavo_auth::Credentials;
use bitvavo_rest::{
    RateLimitConfig, RetryPolicy, SkewConfig, TransportConfig, DEFAULT_ACCESS_WINDOW_MS,
    DEFAULT_BUDGET, DEFAULT_REST_URL,
};
use bitvavo_ws::{ReconnectConfig, StreamConfig, SyncConfig, DEFAULT_WS_URL};
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Environment variable names read by [`ClientConfig::from_env`]
pub mod env {
    /// REST base URL
    pub const REST_URL: &str = "BITVAVO_REST_URL";
    /// WebSocket URL
    pub const WS_URL: &str = "BITVAVO_WS_URL";
    /// Access window in ms
    pub const ACCESS_WINDOW_MS: &str = "BITVAVO_ACCESS_WINDOW_MS";
    /// `true`/`false`
    pub const PREFER_KEYLESS: &str = "BITVAVO_PREFER_KEYLESS";
    /// Default budget per credential
    pub const DEFAULT_RATE_LIMIT: &str = "BITVAVO_DEFAULT_RATE_LIMIT";
    /// Safety buffer per credential
    pub const RATE_LIMIT_BUFFER: &str = "BITVAVO_RATE_LIMIT_BUFFER";
    /// Fixed clock offset in ms
    pub const LAG_MS: &str = "BITVAVO_LAG_MS";
    /// API key (unnumbered)
    pub const API_KEY: &str = "BITVAVO_API_KEY";
    /// API secret (unnumbered)
    pub const API_SECRET: &str = "BITVAVO_API_SECRET";
}

/// Configuration for [`BitvavoClient`](crate::BitvavoClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base URL including `/v2`
    pub rest_url: String,
    /// WebSocket URL
    pub ws_url: String,
    /// Access window for signed requests (ms)
    pub access_window_ms: u64,
    /// API keys, in credential index order
    pub credentials: Vec<Credentials>,
    /// Use keyless access for public requests when it has budget
    pub prefer_keyless: bool,
    /// Budget assumed until the server reports one
    pub default_budget: u32,
    /// Points never spent from any budget
    pub budget_buffer: u32,
    /// Fixed clock offset replacing the estimate
    pub lag_override_ms: Option<i64>,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// Backoff for network and transient REST failures
    pub retry: RetryPolicy,
    /// Re-queues of a request the server answered rate-limited
    pub max_rate_limit_requeues: u32,
    /// Stream reconnection backoff
    pub reconnect: ReconnectConfig,
    /// Reconnect when the stream is silent this long (None = never)
    pub heartbeat_timeout: Option<Duration>,
    /// Authenticate the stream with the first credential
    pub authenticate_stream: bool,
    /// Round trips per clock skew estimate
    pub skew_samples: usize,
    /// Levels per side requested for book snapshots (None = full book)
    pub book_depth: Option<u32>,
    /// Order book synchronizer settings
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            access_window_ms: DEFAULT_ACCESS_WINDOW_MS,
            credentials: Vec::new(),
            prefer_keyless: false,
            default_budget: DEFAULT_BUDGET,
            budget_buffer: 0,
            lag_override_ms: None,
            request_timeout: Duration::from_secs(10),
            retry: transport.retry,
            max_rate_limit_requeues: transport.max_rate_limit_requeues,
            reconnect: ReconnectConfig::default(),
            heartbeat_timeout: Some(Duration::from_secs(60)),
            authenticate_stream: false,
            skew_samples: SkewConfig::default().samples,
            book_depth: None,
            sync: SyncConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `BITVAVO_*` environment variables
    ///
    /// Unset variables keep their defaults. API keys are read from
    /// `BITVAVO_API_KEY`/`BITVAVO_API_SECRET` followed by the numbered pairs
    /// `BITVAVO_API_KEY_1`/`BITVAVO_API_SECRET_1`, `..._2` and so on until
    /// the first missing number.
    pub fn from_env() -> ClientResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> ClientResult<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup(env::REST_URL) {
            config.rest_url = url;
        }
        if let Some(url) = lookup(env::WS_URL) {
            config.ws_url = url;
        }
        if let Some(window) = parse_var(&lookup, env::ACCESS_WINDOW_MS)? {
            config.access_window_ms = window;
        }
        if let Some(prefer) = lookup(env::PREFER_KEYLESS) {
            config.prefer_keyless = parse_bool(env::PREFER_KEYLESS, &prefer)?;
        }
        if let Some(budget) = parse_var(&lookup, env::DEFAULT_RATE_LIMIT)? {
            config.default_budget = budget;
        }
        if let Some(buffer) = parse_var(&lookup, env::RATE_LIMIT_BUFFER)? {
            config.budget_buffer = buffer;
        }
        config.lag_override_ms = parse_var(&lookup, env::LAG_MS)?;

        if let Some(creds) = credential_pair(&lookup, env::API_KEY, env::API_SECRET)? {
            config.credentials.push(creds);
        }
        for n in 1.. {
            let key_var = format!("{}_{}", env::API_KEY, n);
            let secret_var = format!("{}_{}", env::API_SECRET, n);
            match credential_pair(&lookup, &key_var, &secret_var)? {
                Some(creds) => config.credentials.push(creds),
                None => break,
            }
        }

        debug!(
            keys = config.credentials.len(),
            prefer_keyless = config.prefer_keyless,
            "Loaded client configuration from environment"
        );
        config.validate()?;
        Ok(config)
    }

    /// Set the REST base URL
    pub fn with_rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = url.into();
        self
    }

    /// Set the WebSocket URL
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    /// Set the access window
    pub fn with_access_window(mut self, window_ms: u64) -> Self {
        self.access_window_ms = window_ms;
        self
    }

    /// Add an API key
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials.push(credentials);
        self
    }

    /// Prefer keyless access for public requests
    pub fn with_prefer_keyless(mut self, prefer: bool) -> Self {
        self.prefer_keyless = prefer;
        self
    }

    /// Set the default budget
    pub fn with_default_budget(mut self, budget: u32) -> Self {
        self.default_budget = budget;
        self
    }

    /// Set the safety buffer
    pub fn with_budget_buffer(mut self, buffer: u32) -> Self {
        self.budget_buffer = buffer;
        self
    }

    /// Pin the clock offset
    pub fn with_lag_override(mut self, offset_ms: i64) -> Self {
        self.lag_override_ms = Some(offset_ms);
        self
    }

    /// Set the HTTP timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the REST retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the rate-limit re-queue limit
    pub fn with_max_rate_limit_requeues(mut self, requeues: u32) -> Self {
        self.max_rate_limit_requeues = requeues;
        self
    }

    /// Set the stream reconnect backoff
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the stream heartbeat timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Authenticate the stream with the first API key
    pub fn with_stream_auth(mut self, enabled: bool) -> Self {
        self.authenticate_stream = enabled;
        self
    }

    /// Set the number of skew samples
    pub fn with_skew_samples(mut self, samples: usize) -> Self {
        self.skew_samples = samples;
        self
    }

    /// Limit book snapshots to `depth` levels per side
    pub fn with_book_depth(mut self, depth: u32) -> Self {
        self.book_depth = Some(depth);
        self
    }

    /// Set the order book synchronizer settings
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    /// Check the configuration for values that can never work
    pub fn validate(&self) -> ClientResult<()> {
        if self.default_budget == 0 {
            return Err(ClientError::Config("default budget must be positive".into()));
        }
        if self.budget_buffer >= self.default_budget {
            return Err(ClientError::Config(format!(
                "budget buffer {} leaves nothing of the default budget {}",
                self.budget_buffer, self.default_budget
            )));
        }
        if self.access_window_ms == 0 {
            return Err(ClientError::Config("access window must be positive".into()));
        }
        if self.skew_samples == 0 {
            return Err(ClientError::Config("at least one skew sample is required".into()));
        }
        if self.authenticate_stream && self.credentials.is_empty() {
            return Err(ClientError::Config(
                "stream authentication requires an API key".into(),
            ));
        }
        Ok(())
    }

    /// Settings for the REST transport
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::new()
            .with_base_url(self.rest_url.clone())
            .with_access_window(self.access_window_ms)
            .with_retry(self.retry.clone())
            .with_max_rate_limit_requeues(self.max_rate_limit_requeues)
    }

    /// Settings for the rate limit manager
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let config = RateLimitConfig::new()
            .with_default_budget(self.default_budget)
            .with_buffer(self.budget_buffer)
            .with_prefer_keyless(self.prefer_keyless);
        match self.lag_override_ms {
            Some(offset) => config.with_lag_override(offset),
            None => config,
        }
    }

    /// Settings for the skew estimator
    pub fn skew_config(&self) -> SkewConfig {
        SkewConfig::default()
            .with_samples(self.skew_samples)
            .with_default_offset(self.lag_override_ms.unwrap_or(0))
    }

    /// Settings for the stream connection
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::new()
            .with_url(self.ws_url.clone())
            .with_reconnect(self.reconnect.clone())
            .with_heartbeat_timeout(self.heartbeat_timeout)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> ClientResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("{}={:?}: {}", name, raw, e))),
    }
}

fn parse_bool(name: &str, raw: &str) -> ClientResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ClientError::Config(format!(
            "{}={:?}: expected true or false",
            name, raw
        ))),
    }
}

fn credential_pair(
    lookup: &impl Fn(&str) -> Option<String>,
    key_var: &str,
    secret_var: &str,
) -> ClientResult<Option<Credentials>> {
    match (lookup(key_var), lookup(secret_var)) {
        (None, None) => Ok(None),
        (Some(key), Some(secret)) => Ok(Some(Credentials::new(key, secret)?)),
        (Some(_), None) => Err(ClientError::Config(format!("{} is set but {} is not", key_var, secret_var))),
        (None, Some(_)) => Err(ClientError::Config(format!("{} is set but {} is not", secret_var, key_var))),
    }
}
