//! Per-symbol ticker watching.
//!
//! `SubscriptionManager` owns one watch loop per subscribed symbol.
//! Handles:
//! - Spawning and cancelling loops (at most one live loop per symbol)
//! - Change detection against the last delivered ticker
//! - Publishing full price snapshots to the display
//! - Retrying transient stream failures with a fixed backoff
//!
//! Every loop carries the generation it was spawned with. A loop that was
//! removed and is still draining an in-flight pull can never write into
//! the entry of a later subscription to the same symbol.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackoffPolicy;
use crate::connectors::{classify, ExchangeSession};
use crate::events::{DisplayEvent, NoticeLevel, Ticker, UpdateSink};

use super::change::is_update_warranted;
use super::state::{backoff, LoopState, StopReason, WatchHandle};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("Symbol {symbol} not found in {exchange} markets")]
    UnknownSymbol { symbol: String, exchange: String },
}

/// Shared ticker state of one subscription.
#[derive(Debug, Clone)]
struct WatchEntry {
    generation: u64,
    ticker: Ticker,
    /// At least one real value has been published.
    delivered: bool,
}

type EntryMap = Arc<RwLock<BTreeMap<String, WatchEntry>>>;

/// Outcome of offering a fresh ticker to the shared map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Published,
    Unchanged,
    /// The subscription no longer exists for this loop's generation.
    Gone,
}

/// Owns the ticker subscriptions of one exchange session.
pub struct SubscriptionManager {
    session: Arc<dyn ExchangeSession>,
    sink: Arc<dyn UpdateSink>,
    policy: BackoffPolicy,
    entries: EntryMap,
    handles: BTreeMap<String, WatchHandle>,
    next_generation: u64,
}

impl SubscriptionManager {
    pub fn new(
        session: Arc<dyn ExchangeSession>,
        sink: Arc<dyn UpdateSink>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            session,
            sink,
            policy,
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            handles: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Backoff used by loops spawned from now on.
    pub fn set_policy(&mut self, policy: BackoffPolicy) {
        self.policy = policy;
    }

    /// Starts watching `symbol`.
    ///
    /// Returns `Ok(false)` if the symbol is already watched; nothing is
    /// spawned in that case. Symbols unknown to the session's market
    /// metadata are rejected.
    pub fn add(&mut self, symbol: &str) -> Result<bool, SubscribeError> {
        if self.handles.contains_key(symbol) {
            debug!("[{}] Already watching", symbol);
            return Ok(false);
        }

        if !self.session.markets().contains_key(symbol) {
            return Err(SubscribeError::UnknownSymbol {
                symbol: symbol.to_string(),
                exchange: self.session.exchange_id().to_string(),
            });
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        self.entries.write().insert(
            symbol.to_string(),
            WatchEntry {
                generation,
                ticker: Ticker::placeholder(symbol),
                delivered: false,
            },
        );

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);

        let task = tokio::spawn(run_ticker_loop(TickerLoop {
            symbol: symbol.to_string(),
            generation,
            session: self.session.clone(),
            sink: self.sink.clone(),
            entries: self.entries.clone(),
            policy: self.policy,
            cancel: cancel.clone(),
            state: state_tx,
        }));

        self.handles.insert(
            symbol.to_string(),
            WatchHandle::new(symbol, cancel, state_rx, task),
        );

        info!("[{}] Started watching (generation {})", symbol, generation);
        Ok(true)
    }

    /// Stops watching `symbol` and publishes the remaining snapshot.
    ///
    /// The entry is gone when this returns; the returned handle lets the
    /// caller wait for the loop itself to finish draining.
    pub fn remove(&mut self, symbol: &str) -> Option<WatchHandle> {
        let handle = self.handles.remove(symbol)?;
        handle.cancel();

        {
            let mut entries = self.entries.write();
            entries.remove(symbol);
            self.sink
                .publish(DisplayEvent::prices(entries.values().map(|e| &e.ticker)));
        }

        info!("[{}] Stopped watching", symbol);
        Some(handle)
    }

    /// Cancels every loop without publishing. Used when the session is
    /// being replaced.
    pub fn remove_all(&mut self) -> Vec<WatchHandle> {
        self.entries.write().clear();
        let handles: Vec<WatchHandle> = std::mem::take(&mut self.handles).into_values().collect();
        for handle in &handles {
            handle.cancel();
        }
        if !handles.is_empty() {
            info!("Stopped watching {} symbols", handles.len());
        }
        handles
    }

    /// Watched symbols, sorted.
    pub fn list(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.handles.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Last delivered ticker of every watched symbol.
    pub fn snapshot(&self) -> Vec<Ticker> {
        self.entries.read().values().map(|e| e.ticker.clone()).collect()
    }

    pub fn state(&self, symbol: &str) -> Option<LoopState> {
        self.handles.get(symbol).map(WatchHandle::state)
    }

    /// Follows the loop state of `symbol`.
    pub fn subscribe_state(&self, symbol: &str) -> Option<watch::Receiver<LoopState>> {
        self.handles.get(symbol).map(WatchHandle::subscribe)
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for handle in self.handles.values() {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("exchange", &self.session.exchange_id())
            .field("symbols", &self.list())
            .field("next_generation", &self.next_generation)
            .finish()
    }
}

// ============ Watch loop ============

struct TickerLoop {
    symbol: String,
    generation: u64,
    session: Arc<dyn ExchangeSession>,
    sink: Arc<dyn UpdateSink>,
    entries: EntryMap,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    state: watch::Sender<LoopState>,
}

async fn run_ticker_loop(ctx: TickerLoop) {
    let TickerLoop {
        symbol,
        generation,
        session,
        sink,
        entries,
        policy,
        cancel,
        state,
    } = ctx;

    let mut attempt = 0u32;

    let reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }

        state.send_replace(LoopState::Streaming);
        let result = session.stream_ticker(&symbol).await;

        // The pull itself is never interrupted; cancellation lands here.
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }

        match result {
            Ok(ticker) => {
                attempt = 0;
                match apply_tick(&entries, &symbol, generation, ticker, sink.as_ref()) {
                    TickOutcome::Published => debug!("[{}] Price updated", symbol),
                    TickOutcome::Unchanged => {}
                    TickOutcome::Gone => break StopReason::Cancelled,
                }
            }
            Err(e) => {
                let class = classify(&e);
                let Some(wait) = policy.for_tickers(class) else {
                    error!("[{}] Ticker watching stopped ({:?}): {}", symbol, class, e);
                    sink.publish(DisplayEvent::notice(
                        NoticeLevel::Error,
                        format!("Stopped watching {}: {}", symbol, e),
                    ));
                    break StopReason::Fatal(e.to_string());
                };

                attempt += 1;
                warn!(
                    "[{}] Error watching ticker (attempt {}), retrying in {:?}: {}",
                    symbol, attempt, wait, e
                );
                state.send_replace(LoopState::SuspendedRetry { attempt, wait });

                if backoff(&cancel, wait).await {
                    break StopReason::Cancelled;
                }
            }
        }
    };

    // A re-added symbol owns the session stream now; leave it alone.
    if is_superseded(&entries, &symbol, generation) {
        debug!("[{}] Newer subscription active, not releasing stream", symbol);
    } else {
        session.release_ticker(&symbol).await;
    }
    debug!("[{}] Ticker loop exited: {:?}", symbol, reason);
    state.send_replace(LoopState::Stopped(reason));
}

fn is_superseded(
    entries: &RwLock<BTreeMap<String, WatchEntry>>,
    symbol: &str,
    generation: u64,
) -> bool {
    entries
        .read()
        .get(symbol)
        .map_or(false, |entry| entry.generation > generation)
}

/// Stores `ticker` if it changed and publishes the new snapshot.
///
/// Publishing happens under the write lock so snapshots reach the sink in
/// the order they were taken.
fn apply_tick(
    entries: &RwLock<BTreeMap<String, WatchEntry>>,
    symbol: &str,
    generation: u64,
    ticker: Ticker,
    sink: &dyn UpdateSink,
) -> TickOutcome {
    let mut entries = entries.write();

    let entry = match entries.get_mut(symbol) {
        Some(entry) if entry.generation == generation => entry,
        _ => return TickOutcome::Gone,
    };

    if !is_update_warranted(&entry.ticker, &ticker, entry.delivered) {
        return TickOutcome::Unchanged;
    }

    entry.ticker = ticker;
    entry.delivered = true;
    sink.publish(DisplayEvent::prices(entries.values().map(|e| &e.ticker)));
    TickOutcome::Published
}
