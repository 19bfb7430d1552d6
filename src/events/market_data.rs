//! Normalized market data snapshots.
//!
//! Every value the watchers hand to the display is one of these types.
//! Snapshots are immutable: a newer observation replaces the old one
//! wholesale instead of patching it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Raw exchange metadata key that distinguishes perpetual swaps.
const INST_TYPE_KEY: &str = "instType";

/// Raw `instType` value for a perpetual swap.
const PERPETUAL_INST_TYPE: &str = "SWAP";

/// Returns true if the raw exchange payload describes a perpetual swap.
///
/// The flag is never stored; callers derive it from the latest raw payload.
pub fn is_perpetual(raw: &serde_json::Value) -> bool {
    raw.get(INST_TYPE_KEY).and_then(|v| v.as_str()) == Some(PERPETUAL_INST_TYPE)
}

/// A point-in-time price observation for one symbol.
///
/// `last == 0` means no tick has been received yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    /// Change over the exchange's 24h window, in percent.
    pub percentage: Decimal,
    /// Untouched exchange payload.
    #[serde(rename = "info", default)]
    pub raw: serde_json::Value,
}

impl Ticker {
    /// Placeholder for a symbol that has not ticked yet.
    pub fn placeholder(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            last: Decimal::ZERO,
            percentage: Decimal::ZERO,
            raw: serde_json::Value::Null,
        }
    }

    pub fn is_perpetual(&self) -> bool {
        is_perpetual(&self.raw)
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// Margin mode of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Cross,
}

/// A leveraged holding reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub margin_mode: MarginMode,
    pub contracts: Decimal,
    /// Position size in quote currency.
    pub notional: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub leverage: Decimal,
    pub initial_margin: Decimal,
    pub maintenance_margin_percentage: Decimal,
    pub unrealized_pnl: Decimal,
    /// Unrealized PnL relative to initial margin, in percent.
    pub percentage: Decimal,
    #[serde(rename = "info", default)]
    pub raw: serde_json::Value,
}

impl Position {
    /// A position with no contracts left is closed.
    pub fn is_open(&self) -> bool {
        self.contracts > Decimal::ZERO
    }

    pub fn is_perpetual(&self) -> bool {
        is_perpetual(&self.raw)
    }
}

/// Keeps only the open positions from a full position array.
pub fn open_positions(positions: Vec<Position>) -> Vec<Position> {
    positions.into_iter().filter(Position::is_open).collect()
}
