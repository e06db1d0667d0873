//! API credentials for Bitvavo
//!
//! # Security
//!
//! The secret is stored using the `secrecy` crate which:
//! - Zeroizes memory on drop
//! - Prevents accidental logging via Debug impl
//! - Provides explicit access via `expose_secret()`

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::{AuthError, AuthResult};
use crate::signer::{
    Signer, ACCESS_KEY_HEADER, ACCESS_SIGNATURE_HEADER, ACCESS_TIMESTAMP_HEADER,
    ACCESS_WINDOW_HEADER,
};

/// API key and secret pair
pub struct Credentials {
    /// API key (public)
    api_key: String,
    /// API secret (zeroized on drop)
    secret: SecretString,
    signer: Signer,
}

impl Credentials {
    /// Create new credentials
    ///
    /// An empty key or secret is a configuration error reported here rather
    /// than at signing time.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> AuthResult<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(AuthError::InvalidCredentials("API key is empty".into()));
        }

        let secret = SecretString::from(secret.into());
        let signer = Signer::new(secret.expose_secret())?;

        Ok(Self {
            api_key,
            secret,
            signer,
        })
    }

    /// Create credentials from environment variables
    ///
    /// Reads `BITVAVO_API_KEY` and `BITVAVO_API_SECRET`.
    pub fn from_env() -> AuthResult<Self> {
        Self::from_env_vars("BITVAVO_API_KEY", "BITVAVO_API_SECRET")
    }

    /// Create credentials from the numbered pair `BITVAVO_API_KEY_<n>` / `BITVAVO_API_SECRET_<n>`
    pub fn from_env_indexed(n: usize) -> AuthResult<Self> {
        Self::from_env_vars(
            &format!("BITVAVO_API_KEY_{}", n),
            &format!("BITVAVO_API_SECRET_{}", n),
        )
    }

    fn from_env_vars(key_var: &str, secret_var: &str) -> AuthResult<Self> {
        let api_key =
            std::env::var(key_var).map_err(|_| AuthError::EnvVarNotSet(key_var.to_string()))?;
        let secret = std::env::var(secret_var)
            .map_err(|_| AuthError::EnvVarNotSet(secret_var.to_string()))?;

        debug!(var = key_var, "Loaded API credentials from environment");
        Self::new(api_key, secret)
    }

    /// Get the API key
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Sign a request with this credential's secret
    pub fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> String {
        self.signer.sign(timestamp, method, path, body)
    }

    /// Build the full set of authentication headers for a request
    pub fn auth_headers(
        &self,
        timestamp: i64,
        window_ms: u64,
        method: &str,
        path: &str,
        body: &str,
    ) -> AuthHeaders {
        AuthHeaders {
            key: self.api_key.clone(),
            signature: self.sign(timestamp, method, path, body),
            timestamp,
            window_ms,
        }
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            api_key: self.api_key.clone(),
            secret: SecretString::from(self.secret.expose_secret().to_string()),
            signer: self.signer.clone(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field(
                "api_key",
                &format!("{}...", self.api_key.chars().take(8).collect::<String>()),
            )
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Authentication header values for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    /// API key
    pub key: String,
    /// Hex signature
    pub signature: String,
    /// Timestamp the signature was made for (ms)
    pub timestamp: i64,
    /// Access window (ms)
    pub window_ms: u64,
}

impl AuthHeaders {
    /// Header name / value pairs, in a fixed order
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            (ACCESS_KEY_HEADER, self.key.clone()),
            (ACCESS_SIGNATURE_HEADER, self.signature.clone()),
            (ACCESS_TIMESTAMP_HEADER, self.timestamp.to_string()),
            (ACCESS_WINDOW_HEADER, self.window_ms.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::sign;

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials::new("test_api_key", "super_secret_value").unwrap();
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super_secret_value"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_empty_key_or_secret_rejected() {
        assert!(Credentials::new("", "secret").is_err());
        assert!(Credentials::new("key", "").is_err());
    }

    #[test]
    fn test_credentials_sign_matches_free_function() {
        let creds = Credentials::new("key", "s").unwrap();
        assert_eq!(
            creds.sign(1000, "GET", "/orders", ""),
            sign("s", 1000, "GET", "/orders", "").unwrap()
        );
        assert_eq!(creds.clone().sign(1, "GET", "/a", ""), creds.sign(1, "GET", "/a", ""));
    }

    #[test]
    fn test_auth_headers() {
        let creds = Credentials::new("key", "s").unwrap();
        let headers = creds.auth_headers(1000, 10_000, "GET", "/orders", "");
        let pairs = headers.pairs();
        assert_eq!(pairs[0], (ACCESS_KEY_HEADER, "key".to_string()));
        assert_eq!(pairs[2].1, "1000");
        assert_eq!(pairs[3].1, "10000");
        assert_eq!(pairs[1].1, creds.sign(1000, "GET", "/orders", ""));
    }

    #[test]
    fn test_missing_env_var() {
        let err = Credentials::from_env_indexed(987_654).unwrap_err();
        assert_eq!(err, AuthError::EnvVarNotSet("BITVAVO_API_KEY_987654".into()));
    }
}
