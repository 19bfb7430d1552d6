//! Watch provider.
//!
//! Owns the exchange session and every watcher bound to it, and drives
//! them toward the desired `WatchConfig`. Reconciliation runs in two
//! phases:
//! 1. If the session identity changed, validate the new exchange, tear
//!    down every loop of the old session and connect a new one.
//! 2. Diff watched symbols against desired ones; remove first, then add.
//!
//! Every mutation takes `&mut self`, so reconciliations never overlap.
//! Loops cancelled along the way are kept as draining handles until they
//! finish or the provider shuts down.

mod reconcile;

pub use reconcile::{diff_symbols, ReconcileReport, SymbolDiff};

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::connectors::{
    ensure_ticker_capability,
    search_markets,
    ExchangeError,
    ExchangeSession,
    SessionFactory,
    SessionIdentity,
};
use crate::events::{
    ControlCommand,
    DisplayEvent,
    NoticeLevel,
    Position,
    SearchResult,
    Ticker,
    UpdateSink,
};
use crate::watchers::{
    LoopState,
    PositionWatcher,
    SubscribeError,
    SubscriptionManager,
    WatchHandle,
};

/// How long shutdown waits for each loop before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested exchange cannot be built; the prior session is kept.
    #[error("Invalid exchange configuration: {0}")]
    Config(#[source] ExchangeError),

    /// Connecting failed after the old session was torn down.
    #[error("Failed to connect to '{exchange}': {source}")]
    Connect {
        exchange: String,
        #[source]
        source: ExchangeError,
    },

    #[error("No exchange session is active")]
    NoSession,

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
}

/// The session and the watchers bound to it.
struct ActiveSession {
    identity: SessionIdentity,
    session: Arc<dyn ExchangeSession>,
    subscriptions: SubscriptionManager,
    positions: Option<PositionWatcher>,
}

/// Reconciles desired configuration into running watch loops.
pub struct WatchProvider {
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn UpdateSink>,
    desired: WatchConfig,
    active: Option<ActiveSession>,
    draining: Vec<WatchHandle>,
}

impl WatchProvider {
    /// Creates a provider without connecting. Call `start` or
    /// `apply_config` to bring the session up.
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn UpdateSink>,
        desired: WatchConfig,
    ) -> Self {
        Self {
            factory,
            sink,
            desired,
            active: None,
            draining: Vec::new(),
        }
    }

    /// Reconciles against the configuration given at construction.
    pub async fn start(&mut self) -> Result<ReconcileReport, ProviderError> {
        self.apply_config(self.desired.clone()).await
    }

    pub fn desired(&self) -> &WatchConfig {
        &self.desired
    }

    /// Identity of the live session, if any.
    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.active.as_ref().map(|a| &a.identity)
    }

    pub fn session(&self) -> Option<Arc<dyn ExchangeSession>> {
        self.active.as_ref().map(|a| a.session.clone())
    }

    /// Symbols with a live or stopped ticker loop, sorted.
    pub fn watched_symbols(&self) -> Vec<String> {
        self.active
            .as_ref()
            .map(|a| a.subscriptions.list())
            .unwrap_or_default()
    }

    pub fn prices(&self) -> Vec<Ticker> {
        self.active
            .as_ref()
            .map(|a| a.subscriptions.snapshot())
            .unwrap_or_default()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.active
            .as_ref()
            .and_then(|a| a.positions.as_ref())
            .map(PositionWatcher::snapshot)
            .unwrap_or_default()
    }

    pub fn ticker_state(&self, symbol: &str) -> Option<LoopState> {
        self.active.as_ref()?.subscriptions.state(symbol)
    }

    pub fn position_state(&self) -> Option<LoopState> {
        self.active.as_ref()?.positions.as_ref().map(PositionWatcher::state)
    }

    /// Loops that were cancelled but have not exited yet.
    pub fn draining(&mut self) -> usize {
        self.reap();
        self.draining.len()
    }

    // ============ Reconciliation ============

    /// Drives the running state toward `desired`.
    ///
    /// An exchange that cannot be built is rejected before anything is
    /// torn down, leaving the prior session and its loops untouched. A
    /// connection failure after teardown leaves the provider without a
    /// session.
    pub async fn apply_config(
        &mut self,
        mut desired: WatchConfig,
    ) -> Result<ReconcileReport, ProviderError> {
        self.reap();
        desired.normalize();
        let mut report = ReconcileReport::default();

        let identity = desired.identity();
        let needs_session = self
            .active
            .as_ref()
            .map_or(true, |active| active.identity != identity);

        if needs_session {
            if let Err(e) = self.factory.validate(&identity.exchange_id) {
                error!("[{}] Rejected exchange configuration: {}", identity.exchange_id, e);
                self.sink.publish(DisplayEvent::notice(
                    NoticeLevel::Error,
                    format!(
                        "Failed to initialize exchange '{}': {}",
                        identity.exchange_id, e
                    ),
                ));
                return Err(ProviderError::Config(e));
            }

            if let Some(current) = self.identity() {
                info!("Session identity changed: {} -> {}", current, identity);
            }

            self.desired = desired;
            report.removed = self.teardown().await;
            report.positions_started = self.connect().await?;
            report.session_replaced = true;
        } else {
            self.desired = desired;
            if let Some(active) = self.active.as_mut() {
                active.subscriptions.set_policy(self.desired.backoff);
            }
        }

        self.reconcile_symbols(&mut report)?;

        if report.is_noop() {
            debug!("Configuration already converged");
        } else {
            info!(
                "Reconciled: replaced={} removed={:?} added={:?} rejected={:?}",
                report.session_replaced, report.removed, report.added, report.rejected
            );
        }
        Ok(report)
    }

    /// Tears the session down and rebuilds it from the current desired
    /// configuration.
    pub async fn reset(&mut self) -> Result<ReconcileReport, ProviderError> {
        self.reap();
        let mut report = ReconcileReport {
            removed: self.teardown().await,
            ..Default::default()
        };
        report.positions_started = self.connect().await?;
        report.session_replaced = true;
        self.reconcile_symbols(&mut report)?;
        Ok(report)
    }

    /// Stops the position watcher and starts a fresh one if the session is
    /// authenticated. Returns whether a watcher is running afterwards.
    pub fn restart_positions(&mut self) -> Result<bool, ProviderError> {
        self.reap();
        let active = self.active.as_mut().ok_or(ProviderError::NoSession)?;

        if let Some(mut watcher) = active.positions.take() {
            self.draining.extend(watcher.stop());
        }

        if self.desired.session_credentials().is_none() {
            debug!("No credentials, position watcher not restarted");
            return Ok(false);
        }

        active.positions = start_positions(&active.session, &self.sink, &self.desired);
        Ok(active.positions.is_some())
    }

    fn reconcile_symbols(&mut self, report: &mut ReconcileReport) -> Result<(), ProviderError> {
        let active = self.active.as_mut().ok_or(ProviderError::NoSession)?;
        let diff = diff_symbols(&active.subscriptions.list(), &self.desired.desired_symbols());

        for symbol in diff.to_remove {
            if let Some(handle) = active.subscriptions.remove(&symbol) {
                self.draining.push(handle);
                report.removed.push(symbol);
            }
        }

        for symbol in diff.to_add {
            match active.subscriptions.add(&symbol) {
                Ok(true) => report.added.push(symbol),
                Ok(false) => {}
                Err(e) => {
                    warn!("[{}] Not watching: {}", symbol, e);
                    report.rejected.push(symbol);
                }
            }
        }

        Ok(())
    }

    /// Cancels every loop of the current session and discards it.
    /// Returns the symbols that were being watched.
    async fn teardown(&mut self) -> Vec<String> {
        let Some(mut active) = self.active.take() else {
            return Vec::new();
        };

        info!("[{}] Tearing down session", active.identity);
        let removed = active.subscriptions.list();
        self.draining.extend(active.subscriptions.remove_all());
        if let Some(mut watcher) = active.positions.take() {
            self.draining.extend(watcher.stop());
        }
        active.session.close().await;

        self.sink.publish(DisplayEvent::prices(std::iter::empty()));
        self.sink.publish(DisplayEvent::positions(&[]));
        removed
    }

    /// Connects a session for the desired identity. Returns whether a
    /// position watcher was started.
    async fn connect(&mut self) -> Result<bool, ProviderError> {
        let identity = self.desired.identity();
        let exchange_id = identity.exchange_id.clone();
        let credentials = self.desired.session_credentials();
        info!("[{}] Connecting as {}", exchange_id, identity);

        let session = match self.factory.connect(&exchange_id, credentials).await {
            Ok(session) => session,
            Err(e) => {
                error!("[{}] Connection failed: {}", exchange_id, e);
                self.sink.publish(DisplayEvent::notice(
                    NoticeLevel::Error,
                    format!("Failed to initialize exchange '{}': {}", exchange_id, e),
                ));
                return Err(ProviderError::Connect {
                    exchange: exchange_id,
                    source: e,
                });
            }
        };

        if let Err(e) = ensure_ticker_capability(session.as_ref()) {
            error!("[{}] {}", exchange_id, e);
            session.close().await;
            self.sink
                .publish(DisplayEvent::notice(NoticeLevel::Error, e.to_string()));
            return Err(ProviderError::Config(e));
        }

        info!(
            "[{}] Connected, {} markets loaded",
            exchange_id,
            session.markets().len()
        );
        self.sink.publish(DisplayEvent::UpdateExchangeId {
            exchange_id: exchange_id.clone(),
        });
        self.sink.publish(DisplayEvent::notice(
            NoticeLevel::Info,
            format!("Exchange '{}' connected successfully.", exchange_id),
        ));

        let positions = if self.desired.session_credentials().is_some() {
            start_positions(&session, &self.sink, &self.desired)
        } else {
            None
        };
        let positions_started = positions.is_some();

        self.active = Some(ActiveSession {
            identity,
            subscriptions: SubscriptionManager::new(
                session.clone(),
                self.sink.clone(),
                self.desired.backoff,
            ),
            session,
            positions,
        });

        Ok(positions_started)
    }

    /// Drops handles of loops that have exited.
    fn reap(&mut self) {
        self.draining.retain(|handle| !handle.is_finished());
    }

    // ============ Operations ============

    /// Watches `symbol` and records it in the desired configuration.
    pub fn add_coin(&mut self, symbol: &str) -> Result<bool, ProviderError> {
        self.reap();
        let symbol = symbol.trim();
        let active = self.active.as_mut().ok_or(ProviderError::NoSession)?;

        let added = active.subscriptions.add(symbol)?;

        if !self.desired.markets.watch_symbols.iter().any(|s| s == symbol) {
            self.desired.markets.watch_symbols.push(symbol.to_string());
        }
        Ok(added)
    }

    /// Stops watching `symbol` and drops it from the desired configuration.
    pub fn remove_coin(&mut self, symbol: &str) -> bool {
        self.reap();
        let symbol = symbol.trim();
        self.desired.markets.watch_symbols.retain(|s| s != symbol);

        let Some(active) = self.active.as_mut() else {
            return false;
        };
        match active.subscriptions.remove(symbol) {
            Some(handle) => {
                self.draining.push(handle);
                true
            }
            None => false,
        }
    }

    /// Searches the session's markets and publishes the results.
    pub fn search_coins(&self, query: &str) -> Vec<SearchResult> {
        let results = self
            .active
            .as_ref()
            .map(|a| search_markets(a.session.markets(), query))
            .unwrap_or_default();

        debug!("Search '{}' matched {} markets", query, results.len());
        self.sink.publish(DisplayEvent::SearchResults {
            data: results.clone(),
        });
        results
    }

    /// Cancels every loop and waits for all of them to exit.
    pub async fn shutdown(&mut self) {
        info!("Shutting down watch provider");
        self.teardown().await;

        let handles: Vec<WatchHandle> = self.draining.drain(..).collect();
        let count = handles.len();
        join_all(
            handles
                .into_iter()
                .map(|handle| handle.stop_within(SHUTDOWN_GRACE)),
        )
        .await;

        info!("All {} watch loops stopped", count);
    }

    /// Applies one control command. Returns false once shut down.
    pub async fn handle_command(&mut self, command: ControlCommand) -> bool {
        debug!("Handling command: {:?}", command);

        match command {
            ControlCommand::AddCoin { symbol } => {
                if let Err(e) = self.add_coin(&symbol) {
                    warn!("[{}] Failed to add: {}", symbol, e);
                    self.sink
                        .publish(DisplayEvent::notice(NoticeLevel::Warning, e.to_string()));
                }
            }
            ControlCommand::RemoveCoin { symbol } => {
                self.remove_coin(&symbol);
            }
            ControlCommand::SearchCoins { query } => {
                self.search_coins(&query);
            }
            ControlCommand::Configure { config } => {
                if let Err(e) = self.apply_config(config).await {
                    error!("Configuration not applied: {}", e);
                }
            }
            ControlCommand::RefreshMarkets => {
                if let Err(e) = self.reset().await {
                    error!("Refresh failed: {}", e);
                }
            }
            ControlCommand::RefreshPositions => {
                if let Err(e) = self.restart_positions() {
                    warn!("Position refresh failed: {}", e);
                }
            }
            ControlCommand::Shutdown => {
                self.shutdown().await;
                return false;
            }
        }

        true
    }
}

/// Starts a position watcher, downgrading failures to a warning notice.
fn start_positions(
    session: &Arc<dyn ExchangeSession>,
    sink: &Arc<dyn UpdateSink>,
    desired: &WatchConfig,
) -> Option<PositionWatcher> {
    match PositionWatcher::start(session.clone(), sink.clone(), desired.backoff) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("[{}] Positions not watched: {}", session.exchange_id(), e);
            sink.publish(DisplayEvent::notice(NoticeLevel::Warning, e.to_string()));
            None
        }
    }
}

impl std::fmt::Debug for WatchProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchProvider")
            .field("identity", &self.identity())
            .field("watched", &self.watched_symbols())
            .field("draining", &self.draining.len())
            .finish()
    }
}
