//! Scripted exchange doubles for the watcher tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;

use coin_watchdog::config::WatchConfig;
use coin_watchdog::connectors::{
    Capabilities, Credentials, ExchangeError, ExchangeSession, MarketInfo, SessionFactory,
    SessionIdentity,
};
use coin_watchdog::events::{
    DisplayEvent, MarginMode, Position, PositionSide, Ticker, TickerView, UpdateSink,
};

/// Time every scripted pull takes.
pub const PULL_LATENCY: Duration = Duration::from_millis(100);

/// How long a pull with nothing to return waits before timing out.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

pub type Script<T> = VecDeque<Result<T, ExchangeError>>;

/// Session whose pulls replay a per-symbol script.
///
/// Once a script runs dry the last successful value is repeated, like a
/// quiet market. With nothing to repeat, the pull times out with a
/// network error after `IDLE_TIMEOUT`.
pub struct FakeSession {
    exchange_id: String,
    capabilities: Capabilities,
    markets: HashMap<String, MarketInfo>,
    latency: Duration,
    tickers: Mutex<HashMap<String, Script<Ticker>>>,
    last_ticker: Mutex<HashMap<String, Ticker>>,
    positions: Mutex<Script<Vec<Position>>>,
    last_positions: Mutex<Option<Vec<Position>>>,
    ticker_calls: Mutex<HashMap<String, usize>>,
    position_calls: AtomicUsize,
    released: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn new(exchange_id: &str) -> Self {
        let markets = [
            ("BTC/USDT", "BTC", "SPOT"),
            ("ETH/USDT", "ETH", "SPOT"),
            ("SOL/USDT", "SOL", "SPOT"),
            ("BTC/USDT:USDT", "BTC", "SWAP"),
        ]
        .into_iter()
        .map(|(symbol, base, inst_type)| {
            let info = MarketInfo {
                symbol: symbol.to_string(),
                id: symbol.replace('/', "-"),
                base: base.to_string(),
                quote: "USDT".to_string(),
                raw: json!({ "instType": inst_type }),
            };
            (symbol.to_string(), info)
        })
        .collect();

        Self {
            exchange_id: exchange_id.to_string(),
            capabilities: Capabilities {
                watch_ticker: true,
                watch_positions: false,
            },
            markets,
            latency: PULL_LATENCY,
            tickers: Mutex::new(HashMap::new()),
            last_ticker: Mutex::new(HashMap::new()),
            positions: Mutex::new(VecDeque::new()),
            last_positions: Mutex::new(None),
            ticker_calls: Mutex::new(HashMap::new()),
            position_calls: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn authenticated(mut self) -> Self {
        self.capabilities.watch_positions = true;
        self
    }

    pub fn without_ticker(mut self) -> Self {
        self.capabilities.watch_ticker = false;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn script_ticker(&self, symbol: &str, steps: Vec<Result<Ticker, ExchangeError>>) {
        self.tickers
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn script_positions(&self, steps: Vec<Result<Vec<Position>, ExchangeError>>) {
        self.positions.lock().extend(steps);
    }

    pub fn ticker_calls(&self, symbol: &str) -> usize {
        self.ticker_calls.lock().get(symbol).copied().unwrap_or(0)
    }

    pub fn position_calls(&self) -> usize {
        self.position_calls.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<String> {
        let mut released = self.released.lock().clone();
        released.sort();
        released
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeSession for FakeSession {
    fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn markets(&self) -> &HashMap<String, MarketInfo> {
        &self.markets
    }

    async fn stream_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        *self.ticker_calls.lock().entry(symbol.to_string()).or_default() += 1;
        tokio::time::sleep(self.latency).await;

        let step = self
            .tickers
            .lock()
            .get_mut(symbol)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Ok(ticker)) => {
                self.last_ticker
                    .lock()
                    .insert(symbol.to_string(), ticker.clone());
                Ok(ticker)
            }
            Some(Err(e)) => Err(e),
            None => {
                let last = self.last_ticker.lock().get(symbol).cloned();
                match last {
                    Some(ticker) => Ok(ticker),
                    None => idle_timeout().await,
                }
            }
        }
    }

    async fn stream_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.position_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let step = self.positions.lock().pop_front();
        match step {
            Some(Ok(positions)) => {
                *self.last_positions.lock() = Some(positions.clone());
                Ok(positions)
            }
            Some(Err(e)) => Err(e),
            None => {
                let last = self.last_positions.lock().clone();
                match last {
                    Some(positions) => Ok(positions),
                    None => idle_timeout().await,
                }
            }
        }
    }

    async fn release_ticker(&self, symbol: &str) {
        self.released.lock().push(symbol.to_string());
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn idle_timeout<T>() -> Result<T, ExchangeError> {
    tokio::time::sleep(IDLE_TIMEOUT).await;
    Err(ExchangeError::Network("no data before timeout".to_string()))
}

/// Factory handing out `FakeSession`s and recording every connect.
pub struct FakeFactory {
    supported: Vec<String>,
    prepared: Mutex<HashMap<String, FakeSession>>,
    created: Mutex<Vec<Arc<FakeSession>>>,
    connects: Mutex<Vec<SessionIdentity>>,
    fail_next: Mutex<Option<ExchangeError>>,
}

impl FakeFactory {
    pub fn new(supported: &[&str]) -> Self {
        Self {
            supported: supported.iter().map(|s| s.to_string()).collect(),
            prepared: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Uses `session` for the next connect to `exchange_id`.
    pub fn prepare(&self, exchange_id: &str, session: FakeSession) {
        self.prepared.lock().insert(exchange_id.to_string(), session);
    }

    pub fn fail_next_connect(&self, error: ExchangeError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn connects(&self) -> Vec<SessionIdentity> {
        self.connects.lock().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.created.lock().clone()
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no session was created")
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    fn validate(&self, exchange_id: &str) -> Result<(), ExchangeError> {
        if self.supported.iter().any(|s| s == exchange_id) {
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
        self.connects
            .lock()
            .push(SessionIdentity::new(exchange_id, credentials));

        if let Some(e) = self.fail_next.lock().take() {
            return Err(e);
        }

        let prepared = self.prepared.lock().remove(exchange_id);
        let session = match prepared {
            Some(session) => session,
            None if credentials.is_some() => FakeSession::new(exchange_id).authenticated(),
            None => FakeSession::new(exchange_id),
        };

        let session = Arc::new(session);
        self.created.lock().push(session.clone());
        Ok(session)
    }
}

/// Sink keeping every published event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DisplayEvent>>,
}

impl UpdateSink for RecordingSink {
    fn publish(&self, event: DisplayEvent) {
        self.events.lock().push(event);
    }
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DisplayEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Messages of every error-level notice.
    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::Notice { message, .. } if e.is_error() => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every price snapshot, in publish order.
    pub fn price_snapshots(&self) -> Vec<BTreeMap<String, TickerView>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::UpdatePrices { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// `last` of `symbol` in every snapshot that contains it.
    pub fn prices_of(&self, symbol: &str) -> Vec<Decimal> {
        self.price_snapshots()
            .iter()
            .filter_map(|snapshot| snapshot.get(symbol).map(|view| view.ticker.last))
            .collect()
    }

    pub fn position_updates(&self) -> Vec<Vec<Position>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::UpdatePositions { data, .. } => {
                    Some(data.iter().map(|view| view.position.clone()).collect())
                }
                _ => None,
            })
            .collect()
    }

    pub fn exchange_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DisplayEvent::UpdateExchangeId { exchange_id } => Some(exchange_id.clone()),
                _ => None,
            })
            .collect()
    }
}

pub fn ticker(symbol: &str, last: Decimal, percentage: Decimal) -> Ticker {
    let mut ticker = Ticker::placeholder(symbol);
    ticker.last = last;
    ticker.percentage = percentage;
    let inst_type = if symbol.contains(':') { "SWAP" } else { "SPOT" };
    ticker.raw = json!({ "instType": inst_type });
    ticker
}

pub fn position(symbol: &str, contracts: Decimal) -> Position {
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        margin_mode: MarginMode::Cross,
        contracts,
        notional: Decimal::from(1000),
        entry_price: Decimal::from(50_000),
        mark_price: Decimal::from(51_000),
        liquidation_price: None,
        leverage: Decimal::from(10),
        initial_margin: Decimal::from(100),
        maintenance_margin_percentage: Decimal::new(5, 1),
        unrealized_pnl: Decimal::from(20),
        percentage: Decimal::from(20),
        raw: json!({ "instType": "SWAP" }),
    }
}

pub fn config(exchange_id: &str, symbols: &[&str]) -> WatchConfig {
    let mut config = WatchConfig::default();
    config.markets.exchange_id = exchange_id.to_string();
    config.markets.watch_symbols = symbols.iter().map(|s| s.to_string()).collect();
    config
}

pub fn with_credentials(mut config: WatchConfig, secret: &str) -> WatchConfig {
    config.credentials = Some(Credentials::new(
        config.markets.exchange_id.clone(),
        "key",
        secret,
        Some("pass".to_string()),
    ));
    config
}

/// Lets loops run for a while of virtual time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}
