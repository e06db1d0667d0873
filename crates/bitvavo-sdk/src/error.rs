//! Error type for the high-level client

use bitvavo_auth::AuthError;
use bitvavo_book::BookError;
use bitvavo_rest::RestError;
use bitvavo_ws::WsError;

/// Errors returned by [`BitvavoClient`](crate::BitvavoClient)
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// REST request failed
    #[error(transparent)]
    Rest(#[from] RestError),

    /// Stream connection failed
    #[error(transparent)]
    Stream(#[from] WsError),

    /// Order book not available
    #[error(transparent)]
    Book(#[from] BookError),

    /// Credentials could not be built
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No synchronizer exists for the market
    #[error("Order book not tracked: {0}")]
    NotTracked(String),
}

impl ClientError {
    /// Check if retrying the same call can never succeed
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Rest(e) => e.is_fatal(),
            Self::Stream(e) => e.is_fatal(),
            Self::Auth(_) | Self::Config(_) => true,
            Self::Book(_) | Self::NotTracked(_) => false,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
