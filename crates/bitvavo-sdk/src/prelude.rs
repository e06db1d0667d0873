//! Re-exports for convenience
//!
//! Import everything you need with:
//! ```
//! use bitvavo_sdk::prelude::*;
//! ```

// Client
pub use crate::client::BitvavoClient;
pub use crate::config::ClientConfig;
pub use crate::error::{ClientError, ClientResult};

// Types from bitvavo-types
pub use bitvavo_types::{ApiError, BookData, Channel, ErrorClass, Level, RecoveryStrategy, Side};

// Credentials
pub use bitvavo_auth::Credentials;

// REST types
pub use bitvavo_rest::{
    CredentialBudget, CredentialId, Method, RequestDescriptor, Response, RestError, RetryPolicy,
};

// Stream types
pub use bitvavo_ws::{
    BookEvent, ConnectionState, DisconnectReason, FrameReceiver, ReconnectConfig, StreamEvent,
    StreamFrame, SyncConfig,
};

// Orderbook types
pub use bitvavo_book::{BookError, OrderbookSnapshot, OrderbookState};

// Decimal for prices/quantities
pub use rust_decimal::Decimal;
