//! Exchange error type and retry classification.
//!
//! Every stream failure is classified before the watch loop decides what to
//! do next. Typed variants classify directly; free-text exchange messages
//! are matched against known phrases.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("Exchange '{0}' is not supported")]
    UnsupportedExchange(String),

    #[error("Exchange '{exchange}' does not support {capability}")]
    MissingCapability {
        exchange: String,
        capability: &'static str,
    },

    #[error("Symbol {0} not found in markets")]
    UnknownSymbol(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to parse exchange payload: {0}")]
    Parse(String),

    /// Error reported by the exchange that has no dedicated variant.
    #[error("{0}")]
    Exchange(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            ExchangeError::RateLimited(e.to_string())
        } else if e.is_timeout() || e.is_connect() || e.is_request() {
            ExchangeError::Network(e.to_string())
        } else {
            ExchangeError::Exchange(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ExchangeError::Network(e.to_string())
    }
}

/// Retry policy class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Bad key, signature or passphrase. Never retried.
    FatalAuth,
    /// Unknown exchange or missing streaming capability. Never retried.
    FatalConfig,
    TransientBackpressure,
    TransientNetwork,
    TransientUnknown,
}

impl ErrorClass {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::FatalAuth | ErrorClass::FatalConfig)
    }
}

const AUTH_PATTERNS: &[&str] = &[
    "invalid api-key",
    "invalid api key",
    "invalid apikey",
    "invalid ok-access-key",
    "invalid sign",
    "signature",
    "passphrase",
    "login failed",
];

const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many requests", "429"];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection reset",
    "econnreset",
    "connection closed",
    "connection refused",
];

/// Classifies a failure for the watch loops' retry decision.
pub fn classify(error: &ExchangeError) -> ErrorClass {
    match error {
        ExchangeError::UnsupportedExchange(_) | ExchangeError::MissingCapability { .. } => {
            ErrorClass::FatalConfig
        }
        ExchangeError::Authentication(_) => ErrorClass::FatalAuth,
        ExchangeError::RateLimited(_) => ErrorClass::TransientBackpressure,
        ExchangeError::Network(msg) => {
            // A dropped socket can still carry the exchange's auth rejection.
            if matches_any(msg, AUTH_PATTERNS) {
                ErrorClass::FatalAuth
            } else {
                ErrorClass::TransientNetwork
            }
        }
        ExchangeError::UnknownSymbol(_) | ExchangeError::Parse(_) => ErrorClass::TransientUnknown,
        ExchangeError::Exchange(msg) => classify_message(msg),
    }
}

/// Classifies a free-text exchange error message.
pub fn classify_message(message: &str) -> ErrorClass {
    if matches_any(message, AUTH_PATTERNS) {
        ErrorClass::FatalAuth
    } else if matches_any(message, RATE_LIMIT_PATTERNS) {
        ErrorClass::TransientBackpressure
    } else if matches_any(message, NETWORK_PATTERNS) {
        ErrorClass::TransientNetwork
    } else {
        ErrorClass::TransientUnknown
    }
}

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    let lower = message.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}
