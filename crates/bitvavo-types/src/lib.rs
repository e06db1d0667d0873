//! Shared types for the Bitvavo REST and WebSocket APIs
//!
//! This crate holds the wire-level vocabulary used across the workspace.
//! It has minimal dependencies and no async or networking code.
//!
//! # Key Types
//!
//! - [`Channel`], [`Side`] - Subscription and trading enums
//! - [`Level`] - Orderbook price level with decimal precision
//! - [`BookData`] - Book snapshot (REST) or delta (stream) with its sequence number
//! - [`WsMessage`] - Parsed inbound stream frame
//! - [`ApiError`], [`ErrorClass`] - Server error codes and their classification
//! - [`BitvavoError`] - Protocol-level errors
//! - [`Backoff`] - Retry delay schedule

pub mod backoff;
pub mod enums;
pub mod error;
pub mod error_codes;
pub mod level;
pub mod messages;

// Re-export commonly used types
pub use backoff::Backoff;
pub use enums::*;
pub use error::*;
pub use error_codes::*;
pub use level::*;
pub use messages::*;

// Re-export rust_decimal for users
pub use rust_decimal::Decimal;
