//! Budget-gated, signed request execution
//!
//! Every request goes through the same loop:
//!
//! 1. acquire a credential from the [`RateLimitManager`]
//! 2. sign with a skew-adjusted timestamp when a key was selected
//! 3. execute on the [`HttpBackend`]
//! 4. release the credential with whatever came back, always
//! 5. classify: success, throttled (re-queue), transient (backoff) or final

use std::sync::Arc;

use async_trait::async_trait;
use bitvavo_auth::{body_for_signing, Credentials};
use bitvavo_types::{ApiError, ErrorClass};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::backend::{HttpBackend, HttpRequest, HttpResponse, Method};
use crate::clock::Clock;
use crate::error::{RestError, RestResult};
use crate::rate_limit::{CredentialId, RateLimitConfig, RateLimitManager, Throttle};
use crate::retry::RetryPolicy;
use crate::skew::ServerTimeSource;

/// Default REST base URL
pub const DEFAULT_REST_URL: &str = "https://api.bitvavo.com/v2";

/// Default access window (ms)
pub const DEFAULT_ACCESS_WINDOW_MS: u64 = 10_000;

/// Default number of times a throttled request is re-queued
pub const DEFAULT_MAX_RATE_LIMIT_REQUEUES: u32 = 3;

/// Transport configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Base URL including the version segment
    pub base_url: String,
    /// Access window sent with signed requests (ms)
    pub access_window_ms: u64,
    /// Backoff for network and transient failures
    pub retry: RetryPolicy,
    /// How often a request answered rate-limited/banned is re-queued
    pub max_rate_limit_requeues: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REST_URL.to_string(),
            access_window_ms: DEFAULT_ACCESS_WINDOW_MS,
            retry: RetryPolicy::default(),
            max_rate_limit_requeues: DEFAULT_MAX_RATE_LIMIT_REQUEUES,
        }
    }
}

impl TransportConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base URL
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the access window
    pub fn with_access_window(mut self, window_ms: u64) -> Self {
        self.access_window_ms = window_ms;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the re-queue limit
    pub fn with_max_rate_limit_requeues(mut self, requeues: u32) -> Self {
        self.max_rate_limit_requeues = requeues;
        self
    }
}

/// What to send and what it costs
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// HTTP method
    pub method: Method,
    /// Path relative to the base URL, query string included (e.g. `/BTC-EUR/book?depth=10`)
    pub path: String,
    /// JSON body
    pub body: Option<Value>,
    /// Weight charged against the budget
    pub weight: u32,
    /// Whether a key must be used
    pub requires_auth: bool,
}

impl RequestDescriptor {
    /// Create a descriptor with weight 1
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            weight: 1,
            requires_auth: false,
        }
    }

    /// GET request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// POST request with a body
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    /// DELETE request
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Set the body
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Require an API key
    pub fn authenticated(mut self) -> Self {
        self.requires_auth = true;
        self
    }
}

/// Successful response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Parsed body (`Null` when empty)
    pub body: Value,
    /// Credential the request was charged to
    pub credential: CredentialId,
}

impl Response {
    /// Deserialize the body
    pub fn json<T: DeserializeOwned>(self) -> RestResult<T> {
        serde_json::from_value(self.body).map_err(|e| RestError::Parse(e.to_string()))
    }
}

/// How a response should be handled
#[derive(Debug)]
enum Outcome {
    Success(Value),
    Throttled(Throttle),
    Transient(RestError),
    Final(RestError),
}

/// Issues signed, budget-gated requests
pub struct RestTransport {
    config: TransportConfig,
    credentials: Vec<Credentials>,
    limiter: Arc<RateLimitManager>,
    backend: Arc<dyn HttpBackend>,
}

impl std::fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestTransport")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl RestTransport {
    /// Create a transport; one budget is tracked per credential plus keyless
    pub fn new(
        config: TransportConfig,
        credentials: Vec<Credentials>,
        rate_limit: RateLimitConfig,
        backend: Arc<dyn HttpBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = Arc::new(RateLimitManager::new(rate_limit, credentials.len(), clock));
        info!(
            keys = credentials.len(),
            base_url = %config.base_url,
            "Created REST transport"
        );
        Self {
            config,
            credentials,
            limiter,
            backend,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Get the rate limit manager
    pub fn limiter(&self) -> &Arc<RateLimitManager> {
        &self.limiter
    }

    /// Number of API keys
    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Send a request
    ///
    /// Rate limits and bans are waited out inside; network and transient
    /// server failures are retried with backoff; authentication and
    /// validation failures come back immediately.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: &RequestDescriptor) -> RestResult<Response> {
        let body = body_for_signing(request.body.as_ref());
        let mut attempts = 0u32;
        let mut requeues = 0u32;

        loop {
            let credential = self
                .limiter
                .acquire(request.weight, request.requires_auth)
                .await?;
            let http = self.build(request, credential, &body)?;
            attempts += 1;

            let failure = match self.backend.execute(http).await {
                Err(err) => {
                    self.limiter.release(credential, None, None);
                    err
                }
                Ok(response) => {
                    let outcome = interpret(&response);
                    let throttle = match &outcome {
                        Outcome::Throttled(throttle) => Some(*throttle),
                        _ => None,
                    };
                    self.limiter
                        .release(credential, Some(&response.headers), throttle);

                    match outcome {
                        Outcome::Success(body) => {
                            debug!(credential = %credential, status = response.status, "Request succeeded");
                            return Ok(Response {
                                status: response.status,
                                body,
                                credential,
                            });
                        }
                        Outcome::Throttled(throttle) => {
                            requeues += 1;
                            if requeues > self.config.max_rate_limit_requeues {
                                warn!(requeues, "Re-queue limit reached");
                                return Err(RestError::RateLimited {
                                    requeues: requeues - 1,
                                });
                            }
                            info!(credential = %credential, ?throttle, requeues, "Throttled by server, re-queueing");
                            // acquire now waits for the reset or the ban to end
                            attempts -= 1;
                            continue;
                        }
                        Outcome::Final(err) => return Err(err),
                        Outcome::Transient(err) => err,
                    }
                }
            };

            if !self.config.retry.should_retry(attempts) {
                warn!(attempts, error = %failure, "Giving up after retries");
                return Err(failure);
            }
            let delay = self.config.retry.backoff_with_jitter(attempts);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Request failed, retrying"
            );
            self.pause(delay.as_millis() as i64).await?;
        }
    }

    fn build(
        &self,
        request: &RequestDescriptor,
        credential: CredentialId,
        body: &str,
    ) -> RestResult<HttpRequest> {
        let mut headers = Vec::new();

        if let CredentialId::Key(index) = credential {
            let creds = self.credentials.get(index).ok_or_else(|| {
                RestError::Configuration(format!("no credentials for {}", credential))
            })?;
            let timestamp = self.limiter.server_now_ms();
            let auth = creds.auth_headers(
                timestamp,
                self.config.access_window_ms,
                request.method.as_str(),
                &request.path,
                body,
            );
            headers.extend(auth.pairs());
        }

        Ok(HttpRequest {
            method: request.method,
            url: format!("{}{}", self.config.base_url, request.path),
            headers,
            body: (!body.is_empty()).then(|| body.to_string()),
        })
    }

    async fn pause(&self, delay_ms: i64) -> RestResult<()> {
        let clock = self.limiter.clock();
        let deadline = clock.now_ms() + delay_ms;
        tokio::select! {
            () = clock.sleep_until(deadline) => Ok(()),
            () = self.limiter.shutdown_token().cancelled() => Err(RestError::ShuttingDown),
        }
    }
}

#[async_trait]
impl ServerTimeSource for RestTransport {
    async fn server_time_ms(&self) -> RestResult<i64> {
        self.server_time().await
    }
}

/// Decide what a response means
fn interpret(response: &HttpResponse) -> Outcome {
    let status = response.status;
    let text = response.body.trim();

    let body = if text.is_empty() {
        Value::Null
    } else {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(e) if status < 400 => return Outcome::Final(RestError::Parse(e.to_string())),
            Err(_) => return status_failure(status, text),
        }
    };

    if let Some(error) = ApiError::from_body(&body) {
        if let Some(throttle) = Throttle::classify(status, Some(&error)) {
            return Outcome::Throttled(throttle);
        }
        return match error.class() {
            ErrorClass::Transient => Outcome::Transient(RestError::from(error)),
            _ => Outcome::Final(RestError::from(error)),
        };
    }

    if status >= 400 {
        return status_failure(status, text);
    }
    Outcome::Success(body)
}

fn status_failure(status: u16, text: &str) -> Outcome {
    match status {
        429 => Outcome::Throttled(Throttle::RateLimited),
        500..=599 => Outcome::Transient(RestError::Network(format!("HTTP {}: {}", status, text))),
        _ => Outcome::Final(RestError::Api {
            code: i64::from(status),
            message: text.to_string(),
        }),
    }
}
