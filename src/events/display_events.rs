//! Messages exchanged with the display collaborator.
//!
//! `DisplayEvent` flows out of the core, `ControlCommand` flows in. Both
//! are tagged by `command` so they travel as plain JSON objects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WatchConfig;

use super::market_data::{Position, Ticker};

/// Severity of a user-visible notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Ticker as shown to the display, with the derived perpetual flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerView {
    #[serde(flatten)]
    pub ticker: Ticker,
    pub is_perp: bool,
}

impl From<&Ticker> for TickerView {
    fn from(ticker: &Ticker) -> Self {
        Self {
            ticker: ticker.clone(),
            is_perp: ticker.is_perpetual(),
        }
    }
}

/// Position as shown to the display, with the derived perpetual flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub is_perp: bool,
}

impl From<&Position> for PositionView {
    fn from(position: &Position) -> Self {
        Self {
            position: position.clone(),
            is_perp: position.is_perpetual(),
        }
    }
}

/// One hit of a symbol search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub is_perp: bool,
}

/// Outbound notification for the display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum DisplayEvent {
    /// Full current snapshot of every watched symbol.
    UpdatePrices {
        data: BTreeMap<String, TickerView>,
        timestamp: DateTime<Utc>,
    },

    /// All open positions.
    UpdatePositions {
        data: Vec<PositionView>,
        timestamp: DateTime<Utc>,
    },

    SearchResults { data: Vec<SearchResult> },

    /// The exchange the provider is now connected to.
    UpdateExchangeId {
        #[serde(rename = "exchangeId")]
        exchange_id: String,
    },

    /// User-visible message (connection success, fatal errors, warnings).
    Notice { level: NoticeLevel, message: String },
}

impl DisplayEvent {
    /// Builds a price snapshot event from the current ticker map.
    pub fn prices<'a>(tickers: impl IntoIterator<Item = &'a Ticker>) -> Self {
        let data = tickers
            .into_iter()
            .map(|t| (t.symbol.clone(), TickerView::from(t)))
            .collect();
        DisplayEvent::UpdatePrices {
            data,
            timestamp: Utc::now(),
        }
    }

    /// Builds a positions event from the active position snapshot.
    pub fn positions(positions: &[Position]) -> Self {
        DisplayEvent::UpdatePositions {
            data: positions.iter().map(PositionView::from).collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        DisplayEvent::Notice {
            level,
            message: message.into(),
        }
    }

    /// Returns true for an error-level notice.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DisplayEvent::Notice {
                level: NoticeLevel::Error,
                ..
            }
        )
    }
}

/// Inbound request from the display or the settings layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ControlCommand {
    AddCoin { symbol: String },
    RemoveCoin { symbol: String },
    SearchCoins { query: String },
    /// The desired configuration changed.
    Configure { config: WatchConfig },
    /// Rebuild the session from the current configuration.
    RefreshMarkets,
    RefreshPositions,
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_prices_event_shape() {
        let mut btc = Ticker::placeholder("BTC/USDT");
        btc.last = dec!(64000.5);
        let mut perp = Ticker::placeholder("BTC/USDT:USDT");
        perp.raw = json!({ "instType": "SWAP" });

        let event = DisplayEvent::prices([&btc, &perp]);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["command"], "updatePrices");
        assert_eq!(json["data"]["BTC/USDT"]["isPerp"], false);
        assert_eq!(json["data"]["BTC/USDT:USDT"]["isPerp"], true);
        assert_eq!(json["data"]["BTC/USDT"]["symbol"], "BTC/USDT");
    }

    #[test]
    fn test_exchange_id_event_shape() {
        let event = DisplayEvent::UpdateExchangeId {
            exchange_id: "okx".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, json!({ "command": "updateExchangeId", "exchangeId": "okx" }));
    }

    #[test]
    fn test_search_results_shape() {
        let event = DisplayEvent::SearchResults {
            data: vec![SearchResult {
                symbol: "ETH/USDT".to_string(),
                base: "ETH".to_string(),
                quote: "USDT".to_string(),
                is_perp: false,
            }],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["command"], "searchResults");
        assert_eq!(json["data"][0]["isPerp"], false);
    }

    #[test]
    fn test_control_command_parsing() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command":"addCoin","symbol":"SOL/USDT"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::AddCoin { ref symbol } if symbol == "SOL/USDT"));

        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command":"searchCoins","query":"bt"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::SearchCoins { ref query } if query == "bt"));

        let cmd: ControlCommand = serde_json::from_str(r#"{"command":"refreshMarkets"}"#).unwrap();
        assert!(matches!(cmd, ControlCommand::RefreshMarkets));
    }

    #[test]
    fn test_error_notice_detection() {
        assert!(DisplayEvent::notice(NoticeLevel::Error, "boom").is_error());
        assert!(!DisplayEvent::notice(NoticeLevel::Info, "ok").is_error());
    }
}
