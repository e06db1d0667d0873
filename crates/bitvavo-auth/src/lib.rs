//! Credentials and request signing for the Bitvavo API
//!
//! Authenticated REST calls carry four headers: the API key, a hex
//! HMAC-SHA256 signature, the request timestamp and the access window.
//! The signed message is `timestamp + METHOD + "/v2" + path + body`.
//!
//! # Example
//!
//! ```
//! use bitvavo_auth::Credentials;
//!
//! let creds = Credentials::new("my-key", "my-secret").unwrap();
//! let headers = creds.auth_headers(1_700_000_000_000, 10_000, "GET", "/balance", "");
//! assert_eq!(headers.key, "my-key");
//! assert_eq!(headers.signature.len(), 64);
//! ```

mod credentials;
mod error;
mod signer;

pub use credentials::{AuthHeaders, Credentials};
pub use error::{AuthError, AuthResult};
pub use signer::{
    body_for_signing, sign, Signer, ACCESS_KEY_HEADER, ACCESS_SIGNATURE_HEADER,
    ACCESS_TIMESTAMP_HEADER, ACCESS_WINDOW_HEADER, API_PATH_PREFIX,
};
