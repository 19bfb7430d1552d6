//! OKX exchange session.
//!
//! Provides:
//! - REST: instrument metadata (spot + perpetual swaps)
//! - Public WebSocket: one `tickers` stream per watched symbol
//! - Private WebSocket: the `positions` stream, merged into a full array

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::events::{MarginMode, Position, PositionSide, Ticker};

use super::auth::Credentials;
use super::errors::ExchangeError;
use super::session::{Capabilities, ExchangeSession, MarketInfo, SessionFactory};
use super::websocket::{OkxWebSocket, Push, PRIVATE_WS_URL, PUBLIC_WS_URL};

/// Identifier this connector answers to.
pub const EXCHANGE_ID: &str = "okx";

/// Default REST endpoint.
const DEFAULT_REST_URL: &str = "https://www.okx.com";

/// Instrument types loaded at connect.
const INSTRUMENT_TYPES: [&str; 2] = ["SPOT", "SWAP"];

const TICKERS_CHANNEL: &str = "tickers";
const POSITIONS_CHANNEL: &str = "positions";

/// Maps an OKX error code and message onto `ExchangeError`.
pub(crate) fn error_from_code(code: &str, msg: &str) -> ExchangeError {
    match code {
        // Key, sign, passphrase, permission and login rejections.
        "50105" | "50111" | "50113" | "60005" | "60007" | "60009" | "60022" | "60023"
        | "60024" => ExchangeError::Authentication(format!("okx {}: {}", code, msg)),
        "50011" | "60014" => ExchangeError::RateLimited(format!("okx {}: {}", code, msg)),
        _ => ExchangeError::Exchange(format!("okx {}: {}", code, msg)),
    }
}

/// Endpoints for one OKX deployment.
#[derive(Debug, Clone)]
pub struct OkxEndpoints {
    pub rest_url: String,
    pub public_ws_url: String,
    pub private_ws_url: String,
}

impl Default for OkxEndpoints {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            public_ws_url: PUBLIC_WS_URL.to_string(),
            private_ws_url: PRIVATE_WS_URL.to_string(),
        }
    }
}

/// REST client for public OKX metadata.
#[derive(Clone)]
pub struct OkxApiClient {
    client: Client,
    rest_url: String,
}

impl OkxApiClient {
    pub fn new(rest_url: impl Into<String>) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            rest_url: rest_url.into(),
        })
    }

    /// Fetches spot and swap instruments, keyed by unified symbol.
    pub async fn load_markets(&self) -> Result<HashMap<String, MarketInfo>, ExchangeError> {
        let mut markets = HashMap::new();

        for inst_type in INSTRUMENT_TYPES {
            let url = format!("{}/api/v5/public/instruments?instType={}", self.rest_url, inst_type);
            debug!("[okx] Fetching instruments: {}", url);

            let response = self.client.get(&url).send().await?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ExchangeError::RateLimited(format!("okx instruments {}", inst_type)));
            }

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let message = response.text().await.unwrap_or_default();
                return Err(ExchangeError::Exchange(format!("okx HTTP {}: {}", status, message)));
            }

            let body: RestResponse = response
                .json()
                .await
                .map_err(|e| ExchangeError::Parse(format!("instruments response: {}", e)))?;

            if body.code != "0" {
                return Err(error_from_code(&body.code, &body.msg));
            }

            for raw in body.data {
                if let Some(market) = parse_instrument(raw) {
                    markets.insert(market.symbol.clone(), market);
                }
            }
        }

        info!("[okx] Loaded {} markets", markets.len());
        Ok(markets)
    }
}

impl std::fmt::Debug for OkxApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxApiClient")
            .field("rest_url", &self.rest_url)
            .finish()
    }
}

/// Live OKX session.
pub struct OkxSession {
    endpoints: OkxEndpoints,
    credentials: Option<Credentials>,
    markets: HashMap<String, MarketInfo>,
    /// Open ticker sockets, parked between pulls.
    ticker_sockets: Mutex<HashMap<String, OkxWebSocket>>,
    position_socket: tokio::sync::Mutex<Option<OkxWebSocket>>,
    /// Last known state of every position, keyed by instrument and side.
    position_cache: Mutex<HashMap<String, Position>>,
}

impl OkxSession {
    pub fn new(
        endpoints: OkxEndpoints,
        credentials: Option<Credentials>,
        markets: HashMap<String, MarketInfo>,
    ) -> Self {
        Self {
            endpoints,
            credentials,
            markets,
            ticker_sockets: Mutex::new(HashMap::new()),
            position_socket: tokio::sync::Mutex::new(None),
            position_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn open_ticker_socket(&self, symbol: &str, inst_id: &str) -> Result<OkxWebSocket, ExchangeError> {
        let mut ws = OkxWebSocket::connect(symbol, &self.endpoints.public_ws_url).await?;
        ws.subscribe(serde_json::json!({ "channel": TICKERS_CHANNEL, "instId": inst_id }))
            .await?;
        Ok(ws)
    }

    async fn open_position_socket(&self) -> Result<OkxWebSocket, ExchangeError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::Authentication("credentials required for positions".to_string()))?;

        let mut ws = OkxWebSocket::connect("positions", &self.endpoints.private_ws_url).await?;
        ws.login(credentials).await?;
        ws.subscribe(serde_json::json!({ "channel": POSITIONS_CHANNEL, "instType": "ANY" }))
            .await?;
        Ok(ws)
    }

    /// Forgets every cached position.
    ///
    /// A fresh socket starts with a snapshot of what is open now, so
    /// anything closed while disconnected must not survive.
    fn reset_positions(&self) {
        self.position_cache.lock().clear();
    }

    /// Merges a positions push into the cache and returns the full array.
    ///
    /// A snapshot push replaces the cache instead of updating it.
    fn merge_positions(&self, push: Push) -> Vec<Position> {
        let mut cache = self.position_cache.lock();
        if push.snapshot {
            cache.clear();
        }
        for raw in push.data {
            match parse_position(raw, &self.markets) {
                Ok((key, position)) => {
                    cache.insert(key, position);
                }
                Err(e) => warn!("[positions] Skipping unparseable position: {}", e),
            }
        }
        let mut positions: Vec<Position> = cache.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }
}

#[async_trait]
impl ExchangeSession for OkxSession {
    fn exchange_id(&self) -> &str {
        EXCHANGE_ID
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            watch_ticker: true,
            watch_positions: self.credentials.is_some(),
        }
    }

    fn markets(&self) -> &HashMap<String, MarketInfo> {
        &self.markets
    }

    async fn stream_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let market = self
            .markets
            .get(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;

        let parked = self.ticker_sockets.lock().remove(symbol);
        let mut ws = match parked {
            Some(ws) => ws,
            None => self.open_ticker_socket(symbol, &market.id).await?,
        };

        // On error the socket is dropped; the next pull reconnects.
        let push = ws.next_push(TICKERS_CHANNEL).await?;
        self.ticker_sockets
            .lock()
            .entry(symbol.to_string())
            .or_insert(ws);

        let raw = push
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Parse("empty tickers push".to_string()))?;
        parse_ticker(symbol, raw)
    }

    async fn stream_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let mut slot = self.position_socket.lock().await;
        if slot.is_none() {
            let ws = self.open_position_socket().await?;
            self.reset_positions();
            *slot = Some(ws);
        }

        let result = match slot.as_mut() {
            Some(ws) => ws.next_push(POSITIONS_CHANNEL).await,
            None => return Err(ExchangeError::Network("positions socket unavailable".to_string())),
        };

        match result {
            Ok(push) => Ok(self.merge_positions(push)),
            Err(e) => {
                *slot = None;
                Err(e)
            }
        }
    }

    async fn release_ticker(&self, symbol: &str) {
        let parked = self.ticker_sockets.lock().remove(symbol);
        if let Some(ws) = parked {
            ws.close().await;
        }
    }

    async fn close(&self) {
        let sockets: Vec<OkxWebSocket> = self.ticker_sockets.lock().drain().map(|(_, ws)| ws).collect();
        for ws in sockets {
            ws.close().await;
        }
        if let Some(ws) = self.position_socket.lock().await.take() {
            ws.close().await;
        }
        info!("[okx] Session closed");
    }
}

impl std::fmt::Debug for OkxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxSession")
            .field("markets", &self.markets.len())
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}

/// Builds OKX sessions.
#[derive(Debug, Clone, Default)]
pub struct OkxConnector {
    endpoints: OkxEndpoints,
}

impl OkxConnector {
    pub fn with_endpoints(endpoints: OkxEndpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl SessionFactory for OkxConnector {
    fn validate(&self, exchange_id: &str) -> Result<(), ExchangeError> {
        if exchange_id == EXCHANGE_ID {
            Ok(())
        } else {
            Err(ExchangeError::UnsupportedExchange(exchange_id.to_string()))
        }
    }

    async fn connect(
        &self,
        exchange_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn ExchangeSession>, ExchangeError> {
        self.validate(exchange_id)?;

        if let Some(creds) = credentials {
            if creds.passphrase.as_deref().map_or(true, str::is_empty) {
                return Err(ExchangeError::Authentication(
                    "okx requires a passphrase".to_string(),
                ));
            }
        }

        let client = OkxApiClient::new(self.endpoints.rest_url.clone())?;
        let markets = client.load_markets().await?;

        Ok(Arc::new(OkxSession::new(
            self.endpoints.clone(),
            credentials.cloned(),
            markets,
        )))
    }
}

// ============ Response Types ============

#[derive(Debug, Deserialize)]
struct RestResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    inst_id: String,
    inst_type: String,
    #[serde(default)]
    base_ccy: String,
    #[serde(default)]
    quote_ccy: String,
    #[serde(default)]
    settle_ccy: String,
    #[serde(default)]
    uly: String,
    #[serde(default)]
    state: String,
}

// ============ Helper Functions ============

/// Converts an instrument into unified market metadata.
///
/// Spot `BTC-USDT` becomes `BTC/USDT`; swap `BTC-USDT-SWAP` becomes
/// `BTC/USDT:USDT`. Other types and suspended instruments are skipped.
fn parse_instrument(raw: serde_json::Value) -> Option<MarketInfo> {
    let inst: Instrument = serde_json::from_value(raw.clone()).ok()?;
    if !inst.state.is_empty() && inst.state != "live" {
        return None;
    }

    let (symbol, base, quote) = match inst.inst_type.as_str() {
        "SPOT" => (
            format!("{}/{}", inst.base_ccy, inst.quote_ccy),
            inst.base_ccy,
            inst.quote_ccy,
        ),
        "SWAP" => {
            let (base, quote) = inst.uly.split_once('-')?;
            (
                format!("{}/{}:{}", base, quote, inst.settle_ccy),
                base.to_string(),
                quote.to_string(),
            )
        }
        _ => return None,
    };

    Some(MarketInfo {
        symbol,
        id: inst.inst_id,
        base,
        quote,
        raw,
    })
}

fn decimal_field(raw: &serde_json::Value, key: &str) -> Option<Decimal> {
    raw.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .and_then(|s| Decimal::from_str(s).ok())
}

/// Parses a `tickers` push entry.
fn parse_ticker(symbol: &str, raw: serde_json::Value) -> Result<Ticker, ExchangeError> {
    let last = decimal_field(&raw, "last")
        .ok_or_else(|| ExchangeError::Parse(format!("ticker {} without last price", symbol)))?;

    let percentage = match decimal_field(&raw, "open24h") {
        Some(open) if !open.is_zero() => ((last - open) / open * Decimal::ONE_HUNDRED).round_dp(4),
        _ => Decimal::ZERO,
    };

    Ok(Ticker {
        symbol: symbol.to_string(),
        last,
        percentage,
        raw,
    })
}

/// Parses a `positions` push entry into a cache key and a position.
fn parse_position(
    raw: serde_json::Value,
    markets: &HashMap<String, MarketInfo>,
) -> Result<(String, Position), ExchangeError> {
    let inst_id = raw
        .get("instId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ExchangeError::Parse("position without instId".to_string()))?
        .to_string();
    let pos_side = raw.get("posSide").and_then(|v| v.as_str()).unwrap_or("net").to_string();

    let symbol = markets
        .values()
        .find(|m| m.id == inst_id)
        .map(|m| m.symbol.clone())
        .unwrap_or_else(|| inst_id.clone());

    let pos = decimal_field(&raw, "pos").unwrap_or_default();
    let side = match pos_side.as_str() {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        _ if pos < Decimal::ZERO => PositionSide::Short,
        _ => PositionSide::Long,
    };
    let margin_mode = match raw.get("mgnMode").and_then(|v| v.as_str()) {
        Some("isolated") => MarginMode::Isolated,
        _ => MarginMode::Cross,
    };

    let notional = decimal_field(&raw, "notionalUsd").unwrap_or_default();
    let maintenance_margin = decimal_field(&raw, "mmr").unwrap_or_default();
    let maintenance_margin_percentage = if notional.is_zero() {
        Decimal::ZERO
    } else {
        (maintenance_margin / notional * Decimal::ONE_HUNDRED).round_dp(4)
    };

    let position = Position {
        symbol,
        side,
        margin_mode,
        contracts: pos.abs(),
        notional,
        entry_price: decimal_field(&raw, "avgPx").unwrap_or_default(),
        mark_price: decimal_field(&raw, "markPx").unwrap_or_default(),
        liquidation_price: decimal_field(&raw, "liqPx"),
        leverage: decimal_field(&raw, "lever").unwrap_or_default(),
        initial_margin: decimal_field(&raw, "imr")
            .or_else(|| decimal_field(&raw, "margin"))
            .unwrap_or_default(),
        maintenance_margin_percentage,
        unrealized_pnl: decimal_field(&raw, "upl").unwrap_or_default(),
        percentage: decimal_field(&raw, "uplRatio")
            .map(|r| r * Decimal::ONE_HUNDRED)
            .unwrap_or_default(),
        raw,
    };

    Ok((format!("{}:{}", inst_id, pos_side), position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn swap_markets() -> HashMap<String, MarketInfo> {
        let market = parse_instrument(json!({
            "instId": "BTC-USDT-SWAP", "instType": "SWAP", "uly": "BTC-USDT",
            "settleCcy": "USDT", "state": "live"
        }))
        .unwrap();
        HashMap::from([(market.symbol.clone(), market)])
    }

    #[test]
    fn test_parse_spot_instrument() {
        let market = parse_instrument(json!({
            "instId": "ETH-USDT", "instType": "SPOT", "baseCcy": "ETH",
            "quoteCcy": "USDT", "state": "live"
        }))
        .unwrap();
        assert_eq!(market.symbol, "ETH/USDT");
        assert_eq!(market.id, "ETH-USDT");
        assert_eq!(market.base, "ETH");
        assert!(!market.is_perpetual());
    }

    #[test]
    fn test_parse_swap_instrument() {
        let markets = swap_markets();
        let market = &markets["BTC/USDT:USDT"];
        assert_eq!(market.id, "BTC-USDT-SWAP");
        assert_eq!(market.quote, "USDT");
        assert!(market.is_perpetual());
    }

    #[test]
    fn test_suspended_instrument_skipped() {
        assert!(parse_instrument(json!({
            "instId": "X-USDT", "instType": "SPOT", "baseCcy": "X",
            "quoteCcy": "USDT", "state": "suspend"
        }))
        .is_none());
    }

    #[test]
    fn test_parse_ticker_percentage() {
        let ticker = parse_ticker(
            "BTC/USDT",
            json!({ "instId": "BTC-USDT", "last": "110", "open24h": "100" }),
        )
        .unwrap();
        assert_eq!(ticker.last, dec!(110));
        assert_eq!(ticker.percentage, dec!(10));
    }

    #[test]
    fn test_parse_ticker_requires_last() {
        assert!(parse_ticker("BTC/USDT", json!({ "open24h": "100" })).is_err());
    }

    #[test]
    fn test_parse_net_short_position() {
        let (key, position) = parse_position(
            json!({
                "instId": "BTC-USDT-SWAP", "instType": "SWAP", "posSide": "net",
                "pos": "-3", "mgnMode": "isolated", "notionalUsd": "1000",
                "mmr": "5", "avgPx": "50000", "markPx": "49000", "liqPx": "",
                "lever": "10", "imr": "100", "upl": "30", "uplRatio": "0.3"
            }),
            &swap_markets(),
        )
        .unwrap();

        assert_eq!(key, "BTC-USDT-SWAP:net");
        assert_eq!(position.symbol, "BTC/USDT:USDT");
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.margin_mode, MarginMode::Isolated);
        assert_eq!(position.contracts, dec!(3));
        assert_eq!(position.liquidation_price, None);
        assert_eq!(position.maintenance_margin_percentage, dec!(0.5));
        assert_eq!(position.percentage, dec!(30));
        assert!(position.is_perpetual());
    }

    fn position_push(snapshot: bool, entries: &[(&str, &str)]) -> Push {
        Push {
            snapshot,
            data: entries
                .iter()
                .map(|(inst_id, pos)| {
                    json!({ "instId": inst_id, "posSide": "net", "pos": pos, "mgnMode": "cross" })
                })
                .collect(),
        }
    }

    fn open_symbols(positions: &[Position]) -> Vec<String> {
        positions
            .iter()
            .filter(|p| !p.contracts.is_zero())
            .map(|p| p.symbol.clone())
            .collect()
    }

    #[test]
    fn test_position_updates_merge_into_cache() {
        let session = OkxSession::new(OkxEndpoints::default(), None, swap_markets());

        session.merge_positions(position_push(false, &[("BTC-USDT-SWAP", "3")]));
        let positions = session.merge_positions(position_push(false, &[("ETH-USDT-SWAP", "1")]));

        assert_eq!(open_symbols(&positions), vec!["BTC/USDT:USDT", "ETH-USDT-SWAP"]);
    }

    #[test]
    fn test_reconnect_forgets_positions_closed_while_down() {
        let session = OkxSession::new(OkxEndpoints::default(), None, swap_markets());
        session.merge_positions(position_push(false, &[("BTC-USDT-SWAP", "3")]));

        session.reset_positions();
        let positions = session.merge_positions(position_push(false, &[("ETH-USDT-SWAP", "1")]));

        assert_eq!(open_symbols(&positions), vec!["ETH-USDT-SWAP"]);
    }

    #[test]
    fn test_snapshot_push_replaces_cache() {
        let session = OkxSession::new(OkxEndpoints::default(), None, swap_markets());
        session.merge_positions(position_push(false, &[("BTC-USDT-SWAP", "3")]));

        let positions = session.merge_positions(position_push(true, &[("ETH-USDT-SWAP", "1")]));

        assert_eq!(open_symbols(&positions), vec!["ETH-USDT-SWAP"]);
    }

    #[test]
    fn test_error_codes() {
        assert!(matches!(
            error_from_code("60024", "Wrong passphrase"),
            ExchangeError::Authentication(_)
        ));
        assert!(matches!(
            error_from_code("50011", "Too Many Requests"),
            ExchangeError::RateLimited(_)
        ));
        assert!(matches!(error_from_code("51001", "Instrument ID does not exist"), ExchangeError::Exchange(_)));
    }

    #[test]
    fn test_connector_validates_identifier() {
        let connector = OkxConnector::default();
        assert!(connector.validate("okx").is_ok());
        assert!(matches!(
            connector.validate("binance"),
            Err(ExchangeError::UnsupportedExchange(_))
        ));
    }
}
