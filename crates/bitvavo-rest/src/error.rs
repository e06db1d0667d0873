//! Error types for REST operations

use bitvavo_auth::AuthError;
use bitvavo_types::{ApiError, ErrorClass, RecoveryStrategy};

/// Errors returned by [`RestTransport::send`](crate::RestTransport::send)
///
/// Rate limits and bans are absorbed by waiting; they only show up here as
/// [`RestError::RateLimited`] once the re-queue limit is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestError {
    /// Connection failure, timeout or 5xx without an error body
    #[error("Network error: {0}")]
    Network(String),

    /// Credential or signature rejected
    #[error("Authentication failed [{code}]: {message}")]
    Authentication {
        /// Server error code
        code: i64,
        /// Server message
        message: String,
    },

    /// Malformed request parameters
    #[error("Validation failed [{code}]: {message}")]
    Validation {
        /// Server error code
        code: i64,
        /// Server message
        message: String,
    },

    /// Any other server-reported error, verbatim
    #[error("API error [{code}]: {message}")]
    Api {
        /// Server error code
        code: i64,
        /// Server message
        message: String,
    },

    /// Server kept answering rate-limited after repeated waits
    #[error("Rate limited after {requeues} re-queued attempts")]
    RateLimited {
        /// Number of times the request was re-queued
        requeues: u32,
    },

    /// Invalid configuration or request (weight too large, no credentials)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The client was shut down while the request was waiting
    #[error("Client is shutting down")]
    ShuttingDown,

    /// Response body could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl RestError {
    /// Get the recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            Self::Network(_) => RecoveryStrategy::Backoff,
            Self::Api { code, message } => ApiError::new(*code, message.clone()).recovery_strategy(),
            Self::RateLimited { .. } => RecoveryStrategy::WaitForReset,
            Self::Validation { .. } => RecoveryStrategy::Surface,
            Self::Authentication { .. }
            | Self::Configuration(_)
            | Self::ShuttingDown
            | Self::Parse(_) => RecoveryStrategy::Fatal,
        }
    }

    /// Check if the transport retries this error with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { code, .. } => ErrorClass::from_code(*code) == ErrorClass::Transient,
            _ => false,
        }
    }

    /// Check if this error cannot be fixed by trying again later
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::Configuration(_) | Self::ShuttingDown
        )
    }
}

impl From<ApiError> for RestError {
    fn from(err: ApiError) -> Self {
        let ApiError { code, message } = err;
        match ErrorClass::from_code(code) {
            ErrorClass::Authentication => Self::Authentication { code, message },
            ErrorClass::Validation => Self::Validation { code, message },
            _ => Self::Api { code, message },
        }
    }
}

impl From<AuthError> for RestError {
    fn from(err: AuthError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for REST operations
pub type RestResult<T> = Result<T, RestError>;
