//! Exchange credentials and request signing.
//!
//! Credentials are a value type: two sets are the same account iff every
//! field compares equal. The fingerprint lets a session be identified
//! without keeping the secret around in comparisons or logs.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HMAC computation failed: {0}")]
    HmacError(String),
}

/// API credentials for a private exchange session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub exchange_id: String,
    pub api_key: String,
    pub secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl Credentials {
    pub fn new(
        exchange_id: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.filter(|p| !p.is_empty()),
        }
    }

    /// Key and secret are both present.
    pub fn is_complete(&self) -> bool {
        !self.exchange_id.is_empty() && !self.api_key.is_empty() && !self.secret.is_empty()
    }

    /// Hex SHA-256 over every field.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.exchange_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.api_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.secret.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.passphrase.as_deref().unwrap_or_default().as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Generates a base64 HMAC-SHA256 signature.
    ///
    /// The signature is computed over: timestamp + method + path + body
    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<String, AuthError> {
        let message = format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body);

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| AuthError::HmacError(e.to_string()))?;
        mac.update(message.as_bytes());

        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Unix timestamp in seconds, as used by WebSocket login.
    pub fn timestamp() -> String {
        Utc::now().timestamp().to_string()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("exchange_id", &self.exchange_id)
            .field("api_key", &"[REDACTED]")
            .field("secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
