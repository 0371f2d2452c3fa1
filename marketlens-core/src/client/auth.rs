//! Request authentication.
//!
//! Public market endpoints work anonymously. Authenticated deployments use
//! either a bearer token or a signed request: RSA-PSS with SHA-256 (MGF1,
//! digest-length salt) over `timestamp_ms + METHOD + path`, base64 encoded,
//! sent with the key id and timestamp in `KALSHI-ACCESS-*` headers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::BlindedSigningKey;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

use super::error::FetchError;

pub const ACCESS_KEY_HEADER: &str = "KALSHI-ACCESS-KEY";
pub const ACCESS_SIGNATURE_HEADER: &str = "KALSHI-ACCESS-SIGNATURE";
pub const ACCESS_TIMESTAMP_HEADER: &str = "KALSHI-ACCESS-TIMESTAMP";

/// Caller-supplied credentials. Loading them is not this crate's job.
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    Anonymous,
    Bearer(String),
    Signed {
        key_id: String,
        key: Arc<BlindedSigningKey<Sha256>>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Signed { key_id, .. } => f
                .debug_struct("Signed")
                .field("key_id", key_id)
                .field("key", &"<redacted>")
                .finish(),
        }
    }
}

impl Credentials {
    /// Signed credentials from a PEM private key, PKCS#8 or PKCS#1.
    pub fn signed(key_id: impl Into<String>, private_key_pem: &str) -> Result<Self, FetchError> {
        let pem = private_key_pem.trim();
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| FetchError::Permanent {
                status: 401,
                message: format!("signing key rejected: {e}"),
            })?;
        Ok(Credentials::Signed {
            key_id: key_id.into(),
            key: Arc::new(BlindedSigningKey::<Sha256>::new(key)),
        })
    }

    /// Headers to attach to a request for `method` on `path`.
    pub fn headers(&self, method: &str, path: &str) -> Result<Vec<(String, String)>, FetchError> {
        match self {
            Credentials::Anonymous => Ok(Vec::new()),
            Credentials::Bearer(token) => {
                Ok(vec![("Authorization".to_string(), format!("Bearer {token}"))])
            }
            Credentials::Signed { key_id, key } => {
                let timestamp = chrono::Utc::now().timestamp_millis();
                let signature = sign(key, timestamp, method, path);
                Ok(vec![
                    (ACCESS_KEY_HEADER.to_string(), key_id.clone()),
                    (ACCESS_SIGNATURE_HEADER.to_string(), signature),
                    (ACCESS_TIMESTAMP_HEADER.to_string(), timestamp.to_string()),
                ])
            }
        }
    }
}

/// Sign `timestamp + method + path`. PSS is randomized, so two signatures
/// of the same text differ.
pub fn sign(key: &BlindedSigningKey<Sha256>, timestamp_ms: i64, method: &str, path: &str) -> String {
    let message = format!("{timestamp_ms}{method}{path}");
    let signature = key.sign_with_rng(&mut rand::thread_rng(), message.as_bytes());
    BASE64.encode(signature.to_bytes())
}
