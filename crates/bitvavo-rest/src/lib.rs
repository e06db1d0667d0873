//! Rate-limit aware REST transport for the Bitvavo API
//!
//! The server charges every request a weight against a per-credential
//! budget and bans credentials that overrun it. This crate keeps requests
//! inside those budgets across several API keys and keyless access.
//!
//! # Components
//!
//! - [`RateLimitManager`] - selects a credential per request and waits for
//!   resets and ban expiry
//! - [`RestTransport`] - signs, sends, reconciles budgets and retries
//! - [`ClockSkewEstimator`] - measures `local - server` so signed
//!   timestamps land inside the access window
//! - [`Clock`] - injectable time source; [`MockClock`] for tests
//!
//! # Example
//!
//! ```no_run
//! use bitvavo_rest::{
//!     RateLimitConfig, RequestDescriptor, ReqwestBackend, RestTransport, SystemClock,
//!     TransportConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = RestTransport::new(
//!         TransportConfig::default(),
//!         vec![],
//!         RateLimitConfig::default(),
//!         Arc::new(ReqwestBackend::new(Duration::from_secs(10))?),
//!         Arc::new(SystemClock),
//!     );
//!
//!     let markets = transport.send(&RequestDescriptor::get("/markets")).await?;
//!     println!("{}", markets.body);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod clock;
pub mod error;
pub mod market;
pub mod rate_limit;
pub mod retry;
pub mod skew;
pub mod transport;

// Re-export main types
pub use backend::{HttpBackend, HttpRequest, HttpResponse, Method, ReqwestBackend};
pub use clock::{Clock, SystemClock};
pub use error::{RestError, RestResult};
pub use market::{weight_for_path, WEIGHT_BOOK, WEIGHT_ORDERS_OPEN, WEIGHT_TIME, WEIGHT_TRADES};
pub use rate_limit::{
    CredentialBudget, CredentialId, RateLimitConfig, RateLimitManager, Throttle, DEFAULT_BUDGET,
};
pub use retry::RetryPolicy;
pub use skew::{ClockSkewEstimator, ServerTimeSource, SkewConfig};
pub use transport::{
    RequestDescriptor, Response, RestTransport, TransportConfig, DEFAULT_ACCESS_WINDOW_MS,
    DEFAULT_REST_URL,
};

#[cfg(any(test, feature = "test-utils"))]
pub use backend::MockBackend;
#[cfg(any(test, feature = "test-utils"))]
pub use clock::MockClock;
