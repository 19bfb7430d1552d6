//! Exchange session abstraction.
//!
//! A session is one live connection to one exchange. The watch loops only
//! ever see this trait, so the core is independent of any exchange's wire
//! protocol. Sessions are created through a `SessionFactory` and replaced,
//! never mutated, when the exchange identity changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::events::{is_perpetual, Position, SearchResult, Ticker};

use super::auth::Credentials;
use super::errors::ExchangeError;

/// Quote asset the symbol search is limited to.
const SEARCH_QUOTE: &str = "/USDT";

/// Who a session is connected as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub exchange_id: String,
    pub credentials_fingerprint: Option<String>,
}

impl SessionIdentity {
    pub fn new(exchange_id: impl Into<String>, credentials: Option<&Credentials>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            credentials_fingerprint: credentials.map(Credentials::fingerprint),
        }
    }
}

impl std::fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.credentials_fingerprint {
            Some(fp) => write!(f, "{} (key {})", self.exchange_id, &fp[..fp.len().min(8)]),
            None => write!(f, "{} (public)", self.exchange_id),
        }
    }
}

/// Streaming primitives a session actually offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub watch_ticker: bool,
    pub watch_positions: bool,
}

/// Market metadata for one tradable symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketInfo {
    /// Unified symbol, e.g. `BTC/USDT` or `BTC/USDT:USDT`.
    pub symbol: String,
    /// Exchange-native instrument id.
    pub id: String,
    pub base: String,
    pub quote: String,
    pub raw: serde_json::Value,
}

impl MarketInfo {
    pub fn is_perpetual(&self) -> bool {
        is_perpetual(&self.raw)
    }
}

/// One live exchange connection shared by every watch loop.
///
/// Both stream methods are blocking pulls: each call resolves with the next
/// update. A failed call may be retried; the session reconnects as needed.
#[async_trait]
pub trait ExchangeSession: Send + Sync {
    fn exchange_id(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Market metadata keyed by unified symbol.
    fn markets(&self) -> &HashMap<String, MarketInfo>;

    /// Waits for the next ticker of `symbol`.
    async fn stream_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    /// Waits for the next full position array.
    async fn stream_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Called once the ticker loop for `symbol` has stopped.
    async fn release_ticker(&self, _symbol: &str) {}

    /// Called when the session is discarded.
    async fn close(&self) {}
}

/// Builds sessions by exchange identifier.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Checks that `exchange_id` can be constructed at all.
    fn validate(&self, exchange_id: &str) -> Result<(), ExchangeError>;

    /// Connects a new session and loads its market metadata.
    async fn connect(
        &self,
        exchange_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ExchangeSession>, ExchangeError>;
}

/// Rejects sessions that cannot stream tickers.
pub fn ensure_ticker_capability(session: &dyn ExchangeSession) -> Result<(), ExchangeError> {
    if session.capabilities().watch_ticker {
        Ok(())
    } else {
        Err(ExchangeError::MissingCapability {
            exchange: session.exchange_id().to_string(),
            capability: "real-time ticker watching",
        })
    }
}

/// Finds `/USDT` markets whose symbol or base asset contains `query`.
///
/// Matching is case-insensitive. An empty query yields nothing.
pub fn search_markets(markets: &HashMap<String, MarketInfo>, query: &str) -> Vec<SearchResult> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return Vec::new();
    }

    let mut results: Vec<SearchResult> = markets
        .values()
        .filter(|m| m.symbol.contains(SEARCH_QUOTE))
        .filter(|m| {
            m.symbol.to_lowercase().contains(&query) || m.base.to_lowercase().contains(&query)
        })
        .map(|m| SearchResult {
            symbol: m.symbol.clone(),
            base: m.base.clone(),
            quote: m.quote.clone(),
            is_perp: m.is_perpetual(),
        })
        .collect();

    results.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    results
}
