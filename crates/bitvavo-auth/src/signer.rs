//! HMAC-SHA256 request signing
//!
//! The signature is the lowercase hex digest of
//! `HMAC-SHA256(secret, timestamp + METHOD + "/v2" + path + body)`.
//! Identical inputs always give identical output.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{AuthError, AuthResult};

type HmacSha256 = Hmac<Sha256>;

/// Version prefix included in every signed path
pub const API_PATH_PREFIX: &str = "/v2";

/// Header carrying the API key
pub const ACCESS_KEY_HEADER: &str = "bitvavo-access-key";
/// Header carrying the hex signature
pub const ACCESS_SIGNATURE_HEADER: &str = "bitvavo-access-signature";
/// Header carrying the request timestamp (ms)
pub const ACCESS_TIMESTAMP_HEADER: &str = "bitvavo-access-timestamp";
/// Header carrying the access window (ms)
pub const ACCESS_WINDOW_HEADER: &str = "bitvavo-access-window";

/// Keyed signer for one secret
///
/// The key is checked once at construction; signing itself cannot fail.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    /// Create a signer, rejecting an empty secret
    pub fn new(secret: &str) -> AuthResult<Self> {
        if secret.is_empty() {
            return Err(AuthError::InvalidCredentials("API secret is empty".into()));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AuthError::InvalidCredentials(format!("Invalid HMAC key: {}", e)))?;
        Ok(Self { mac })
    }

    /// Sign a request
    ///
    /// `path` is relative to the API root (e.g. `/order`); the `/v2` prefix
    /// is added here. `body` is the compact JSON body or an empty string.
    pub fn sign(&self, timestamp: i64, method: &str, path: &str, body: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(method.to_ascii_uppercase().as_bytes());
        mac.update(API_PATH_PREFIX.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Signer([REDACTED])")
    }
}

/// Sign a request with a raw secret
pub fn sign(secret: &str, timestamp: i64, method: &str, path: &str, body: &str) -> AuthResult<String> {
    Ok(Signer::new(secret)?.sign(timestamp, method, path, body))
}

/// Serialize a request body the way it is signed
///
/// An absent body and an empty object both sign as the empty string.
pub fn body_for_signing(body: Option<&Value>) -> String {
    match body {
        None | Some(Value::Null) => String::new(),
        Some(Value::Object(map)) if map.is_empty() => String::new(),
        Some(value) => value.to_string(),
    }
}
