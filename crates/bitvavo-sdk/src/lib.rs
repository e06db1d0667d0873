//! High-level client for the Bitvavo REST and WebSocket APIs
//!
//! This crate wires the workspace together: a rate-limit aware REST
//! transport rotating over several API keys, clock skew correction for
//! signed timestamps, a reconnecting stream connection with declarative
//! subscriptions, and locally maintained order books.
//!
//! # Quick Start
//!
//! ```no_run
//! use bitvavo_sdk::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = BitvavoClient::connect(ClientConfig::from_env()?).await?;
//!
//!     // Public and private REST calls share one rate limiter
//!     let time = client.server_time().await?;
//!     println!("server time: {}", time);
//!
//!     // Locally maintained order book
//!     client.track_book("BTC-EUR");
//!     let book = client.wait_book("BTC-EUR", Duration::from_secs(5)).await?;
//!     println!("BTC-EUR mid: {:?}", book.mid_price());
//!
//!     // Raw channel frames
//!     let mut trades = client.subscribe(Channel::Trades, "BTC-EUR");
//!     while let Some(frame) = trades.recv().await {
//!         println!("{:?}", frame);
//!     }
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Rate limiting**: per-credential budgets reconciled with server headers
//! - **Key rotation**: requests go to the credential with the most budget
//! - **Clock skew**: signed timestamps use the estimated server time
//! - **Automatic Reconnection**: exponential backoff with jitter, full
//!   subscription restore
//! - **Orderbook Management**: sequence-checked books resynced from REST

pub mod client;
pub mod config;
pub mod error;
pub mod prelude;
pub mod snapshot;

// Re-export main types
pub use client::BitvavoClient;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use snapshot::RestSnapshotSource;

// Re-export commonly used types from dependencies
pub use bitvavo_auth::Credentials;
pub use bitvavo_book::{BookError, OrderbookSnapshot, OrderbookState};
pub use bitvavo_rest::{CredentialId, RequestDescriptor, Response, RestError};
pub use bitvavo_types::{Channel, Level};
pub use bitvavo_ws::{BookEvent, ConnectionState, StreamEvent, StreamFrame};
