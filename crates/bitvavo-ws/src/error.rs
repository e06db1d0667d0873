//! Error types for the streaming client

use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    /// Not connected
    #[error("not connected")]
    NotConnected,

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by [`StreamConnection`](crate::StreamConnection) and
/// [`OrderBookSynchronizer`](crate::OrderBookSynchronizer)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    /// Underlying transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server refused the authentication handshake
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Every reconnect attempt failed
    #[error("reconnection attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// `run` was called while the connection was already running or finished
    #[error("connection is already running or has been consumed")]
    AlreadyRunning,

    /// Snapshot could not be fetched
    #[error("snapshot for {market} failed: {message}")]
    Snapshot {
        /// Market of the book
        market: String,
        /// Underlying failure
        message: String,
    },

    /// Serialization of an outbound message failed
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl WsError {
    /// Check if this error ends the connection for good
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationRejected(_) | Self::ReconnectExhausted { .. } | Self::AlreadyRunning
        )
    }
}

/// Result type alias for streaming operations
pub type WsResult<T> = Result<T, WsError>;
