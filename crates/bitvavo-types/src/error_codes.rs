//! Bitvavo API error codes and their classification
//!
//! Error bodies look like `{"errorCode": 105, "error": "..."}`. The code
//! decides how the client reacts: wait for a budget reset, wait out a ban,
//! retry with backoff, or surface the error to the caller.

use serde_json::Value;
use std::time::Duration;

/// Fallback ban length when the expiry cannot be read from the message
pub const BAN_FALLBACK_MS: i64 = 60_000;

/// Fallback budget reset when a rate-limit error carries no reset header
pub const RATE_LIMIT_FALLBACK_MS: i64 = 60_000;

/// Broad class of a server error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Weight budget exhausted (103, 104, or HTTP 429)
    RateLimited,
    /// Temporary ban with an embedded expiry (105)
    Banned,
    /// Overloaded / processing issue / server timeout (107-109)
    Transient,
    /// Credential or signature rejected (300-399)
    Authentication,
    /// Malformed request parameters (200-299)
    Validation,
    /// Any other server-reported error
    Other,
}

impl ErrorClass {
    /// Classify a numeric error code
    pub fn from_code(code: i64) -> Self {
        match code {
            103 | 104 => Self::RateLimited,
            105 => Self::Banned,
            107..=109 => Self::Transient,
            200..=299 => Self::Validation,
            300..=399 => Self::Authentication,
            _ => Self::Other,
        }
    }
}

/// How a caller is expected to recover from an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry with exponential backoff
    Backoff,
    /// Wait until the budget resets, then retry
    WaitForReset,
    /// Wait until the given server timestamp (ms), then retry
    WaitUntil {
        /// Server epoch ms at which the ban lifts
        resume_at_ms: i64,
    },
    /// Cannot recover programmatically
    Fatal,
    /// Surface to the caller verbatim
    Surface,
}

impl RecoveryStrategy {
    /// Check if this strategy allows retry
    pub fn allows_retry(&self) -> bool {
        matches!(
            self,
            Self::Backoff | Self::WaitForReset | Self::WaitUntil { .. }
        )
    }
}

/// Parsed server error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Numeric error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
}

impl ApiError {
    /// Create a new API error
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Extract an error from a JSON body, if it is one
    ///
    /// Accepts the flat `{"errorCode", "error"}` form as well as the nested
    /// `{"error": {"code", "message"}}` form.
    pub fn from_body(body: &Value) -> Option<Self> {
        if let Some(code) = body.get("errorCode").and_then(Value::as_i64) {
            let message = body
                .get("error")
                .or_else(|| body.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Some(Self::new(code, message));
        }

        let nested = body.get("error")?.as_object()?;
        let code = nested.get("code").and_then(Value::as_i64)?;
        let message = nested
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(Self::new(code, message))
    }

    /// Classification of this error's code
    pub fn class(&self) -> ErrorClass {
        ErrorClass::from_code(self.code)
    }

    /// Ban expiry (server epoch ms) embedded in the message, if any
    ///
    /// Messages read "... The ban expires at 1693843260000". The last run
    /// of at least ten digits is taken as the timestamp.
    pub fn ban_expiry_ms(&self) -> Option<i64> {
        self.message
            .split(|c: char| !c.is_ascii_digit())
            .filter(|run| run.len() >= 10)
            .last()
            .and_then(|run| run.parse().ok())
    }

    /// Recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self.class() {
            ErrorClass::RateLimited => RecoveryStrategy::WaitForReset,
            ErrorClass::Banned => match self.ban_expiry_ms() {
                Some(resume_at_ms) => RecoveryStrategy::WaitUntil { resume_at_ms },
                None => RecoveryStrategy::WaitForReset,
            },
            ErrorClass::Transient => RecoveryStrategy::Backoff,
            ErrorClass::Authentication => RecoveryStrategy::Fatal,
            ErrorClass::Validation | ErrorClass::Other => RecoveryStrategy::Surface,
        }
    }

    /// Fallback wait when the server gives no usable timestamp
    pub fn fallback_wait(&self) -> Duration {
        match self.class() {
            ErrorClass::Banned => Duration::from_millis(BAN_FALLBACK_MS as u64),
            _ => Duration::from_millis(RATE_LIMIT_FALLBACK_MS as u64),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        assert_eq!(ErrorClass::from_code(103), ErrorClass::RateLimited);
        assert_eq!(ErrorClass::from_code(105), ErrorClass::Banned);
        assert_eq!(ErrorClass::from_code(108), ErrorClass::Transient);
        assert_eq!(ErrorClass::from_code(205), ErrorClass::Validation);
        assert_eq!(ErrorClass::from_code(309), ErrorClass::Authentication);
        assert_eq!(ErrorClass::from_code(404), ErrorClass::Other);
    }

    #[test]
    fn test_from_flat_body() {
        let err = ApiError::from_body(&json!({"errorCode": 205, "error": "Invalid parameter value."}))
            .unwrap();
        assert_eq!(err.code, 205);
        assert_eq!(err.message, "Invalid parameter value.");
    }

    #[test]
    fn test_from_nested_body() {
        let err = ApiError::from_body(&json!({"error": {"code": 101}})).unwrap();
        assert_eq!(err.code, 101);
        assert!(err.message.is_empty());
    }

    #[test]
    fn test_not_an_error() {
        assert!(ApiError::from_body(&json!({"time": 1})).is_none());
        assert!(ApiError::from_body(&json!([])).is_none());
    }

    #[test]
    fn test_ban_expiry_parsing() {
        let err = ApiError::new(
            105,
            "Your IP or API key has been banned for not respecting the rate limit. The ban expires at 1693843260000.",
        );
        assert_eq!(err.ban_expiry_ms(), Some(1_693_843_260_000));
        assert_eq!(
            err.recovery_strategy(),
            RecoveryStrategy::WaitUntil {
                resume_at_ms: 1_693_843_260_000
            }
        );
    }

    #[test]
    fn test_ban_without_timestamp() {
        let err = ApiError::new(105, "banned");
        assert_eq!(err.ban_expiry_ms(), None);
        assert_eq!(err.fallback_wait(), Duration::from_millis(60_000));
    }

    #[test]
    fn test_recovery_strategies() {
        assert!(!ApiError::new(309, "Invalid signature").recovery_strategy().allows_retry());
        assert!(ApiError::new(107, "overloaded").recovery_strategy().allows_retry());
        assert_eq!(
            ApiError::new(205, "bad").recovery_strategy(),
            RecoveryStrategy::Surface
        );
    }
}
