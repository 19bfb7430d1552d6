//! Configuration for the watchdog.
//!
//! Loaded from a TOML file, then overridden by environment variables
//! (a `.env` file is honoured by the binary). The same structure is the
//! "desired state" the provider reconciles against.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::connectors::{Credentials, ErrorClass, SessionIdentity};

const DEFAULT_EXCHANGE: &str = "okx";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Full desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub markets: MarketsConfig,
    pub credentials: Option<Credentials>,
    pub backoff: BackoffPolicy,
}

/// Which exchange to watch and which symbols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketsConfig {
    pub exchange_id: String,
    pub watch_symbols: Vec<String>,
}

impl Default for MarketsConfig {
    fn default() -> Self {
        Self {
            exchange_id: DEFAULT_EXCHANGE.to_string(),
            watch_symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
        }
    }
}

/// Retry waits, in seconds, per error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Every transient ticker failure.
    pub ticker_retry_secs: u64,
    pub rate_limited_secs: u64,
    pub network_secs: u64,
    /// Unrecognized position-stream failures.
    pub position_unknown_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            ticker_retry_secs: 3,
            rate_limited_secs: 30,
            network_secs: 10,
            position_unknown_secs: 15,
        }
    }
}

impl BackoffPolicy {
    /// Wait before retrying a ticker stream. Fatal classes never retry.
    pub fn for_tickers(&self, class: ErrorClass) -> Option<Duration> {
        if class.is_fatal() {
            None
        } else {
            Some(Duration::from_secs(self.ticker_retry_secs))
        }
    }

    /// Wait before retrying the position stream. Fatal classes never retry.
    pub fn for_positions(&self, class: ErrorClass) -> Option<Duration> {
        let secs = match class {
            ErrorClass::FatalAuth | ErrorClass::FatalConfig => return None,
            ErrorClass::TransientBackpressure => self.rate_limited_secs,
            ErrorClass::TransientNetwork => self.network_secs,
            ErrorClass::TransientUnknown => self.position_unknown_secs,
        };
        Some(Duration::from_secs(secs))
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            markets: MarketsConfig::default(),
            credentials: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl WatchConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: WatchConfig = toml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(exchange) = lookup("COIN_WATCHDOG_EXCHANGE").filter(|s| !s.is_empty()) {
            self.markets.exchange_id = exchange;
        }

        if let Some(symbols) = lookup("COIN_WATCHDOG_SYMBOLS") {
            self.markets.watch_symbols = symbols.split(',').map(str::to_string).collect();
        }

        if let (Some(api_key), Some(secret)) = (
            lookup("COIN_WATCHDOG_API_KEY"),
            lookup("COIN_WATCHDOG_API_SECRET"),
        ) {
            self.credentials = Some(Credentials::new(
                self.markets.exchange_id.clone(),
                api_key,
                secret,
                lookup("COIN_WATCHDOG_API_PASSPHRASE"),
            ));
        }

        self.normalize();
    }

    /// Trims symbols, drops blanks and duplicates while keeping order.
    pub fn normalize(&mut self) {
        let mut seen = BTreeSet::new();
        self.markets.watch_symbols = self
            .markets
            .watch_symbols
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();

        if let Some(creds) = self.credentials.as_mut() {
            if creds.passphrase.as_deref().is_some_and(str::is_empty) {
                creds.passphrase = None;
            }
        }
    }

    /// Credentials the session should authenticate with, if any.
    ///
    /// Incomplete credentials, or credentials for a different exchange, are
    /// ignored and the session stays public.
    pub fn session_credentials(&self) -> Option<&Credentials> {
        let creds = self.credentials.as_ref()?;
        if !creds.is_complete() {
            debug!("Exchange credentials incomplete, positions will not be watched");
            return None;
        }
        if creds.exchange_id != self.markets.exchange_id {
            debug!(
                "Credentials are for '{}', markets use '{}'; positions will not be watched",
                creds.exchange_id, self.markets.exchange_id
            );
            return None;
        }
        Some(creds)
    }

    /// Identity of the session this configuration asks for.
    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(self.markets.exchange_id.clone(), self.session_credentials())
    }

    /// The desired symbol set.
    pub fn desired_symbols(&self) -> BTreeSet<String> {
        self.markets.watch_symbols.iter().cloned().collect()
    }
}
