//! Protocol-level error types

use thiserror::Error;

/// Errors raised while interpreting Bitvavo wire data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitvavoError {
    /// Failed to parse JSON message
    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String, raw: Option<String> },

    /// Message was valid JSON but not of the expected shape
    #[error("Unexpected message format: {0}")]
    UnexpectedMessage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Result type alias for protocol operations
pub type BitvavoResult<T> = Result<T, BitvavoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BitvavoError::Configuration("empty secret".into());
        assert_eq!(err.to_string(), "Configuration error: empty secret");
    }
}
