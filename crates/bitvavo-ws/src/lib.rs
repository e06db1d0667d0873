//! Streaming client for the Bitvavo WebSocket API
//!
//! # Features
//!
//! - Reconnecting session with exponential backoff and jitter
//! - Declarative subscriptions, restored in full after every reconnect
//! - Optional authentication handshake (fatal when rejected)
//! - Per-market orderbook synchronization with snapshot resync on gaps
//! - Non-blocking dispatch: each (channel, market) gets its own queue
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bitvavo_types::Channel;
//! use bitvavo_ws::{StreamConfig, StreamConnection, SubscriptionRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = Arc::new(SubscriptionRegistry::new());
//!     let mut trades = registry.subscribe(Channel::Trades, "BTC-EUR");
//!
//!     let conn = Arc::new(StreamConnection::websocket(StreamConfig::default(), registry));
//!     let task = conn.start();
//!
//!     while let Some(frame) = trades.recv().await {
//!         println!("{:?}", frame);
//!     }
//!
//!     conn.stop();
//!     let _ = task.await;
//! }
//! ```

pub mod book_sync;
pub mod connection;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod subscription;
pub mod transport;

pub use book_sync::{OrderBookSynchronizer, SnapshotSource, SyncConfig, DEFAULT_MAX_BUFFERED};
pub use connection::{ConnectionState, StreamAuth, StreamConfig, StreamConnection, TimestampSource};
pub use error::{TransportError, WsError, WsResult};
pub use events::{BookEvent, DisconnectReason, StreamEvent};
pub use reconnect::ReconnectConfig;
pub use subscription::{
    FrameReceiver, FrameSender, StreamFrame, Subscription, SubscriptionKey, SubscriptionRegistry,
};
pub use transport::{Transport, WsTransport, DEFAULT_WS_URL};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::{MockHandle, MockTransport};
