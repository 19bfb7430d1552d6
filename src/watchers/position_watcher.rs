//! Account position watching.
//!
//! A single loop per session pulls the full position array, keeps the
//! open ones and publishes them on every update. There is no change
//! detection here: an unchanged array is published again.
//!
//! Failures are classified. Authentication and configuration errors stop
//! the loop with exactly one user-visible error; everything else is
//! retried after a per-class wait.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BackoffPolicy;
use crate::connectors::{classify, ExchangeError, ExchangeSession};
use crate::events::{open_positions, DisplayEvent, NoticeLevel, Position, UpdateSink};

use super::state::{backoff, LoopState, StopReason, WatchHandle};

const LABEL: &str = "positions";

/// Watches the open positions of one authenticated session.
pub struct PositionWatcher {
    snapshot: Arc<RwLock<Vec<Position>>>,
    handle: Option<WatchHandle>,
}

impl PositionWatcher {
    /// Spawns the position loop.
    ///
    /// Fails if the session cannot stream positions, which is the case for
    /// every session opened without credentials.
    pub fn start(
        session: Arc<dyn ExchangeSession>,
        sink: Arc<dyn UpdateSink>,
        policy: BackoffPolicy,
    ) -> Result<Self, ExchangeError> {
        if !session.capabilities().watch_positions {
            return Err(ExchangeError::MissingCapability {
                exchange: session.exchange_id().to_string(),
                capability: "real-time positions watching",
            });
        }

        let snapshot = Arc::new(RwLock::new(Vec::new()));
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);

        info!("[{}] Starting position watcher", session.exchange_id());

        let task = tokio::spawn(run_position_loop(PositionLoop {
            session,
            sink,
            snapshot: snapshot.clone(),
            policy,
            cancel: cancel.clone(),
            state: state_tx,
        }));

        Ok(Self {
            snapshot,
            handle: Some(WatchHandle::new(LABEL, cancel, state_rx, task)),
        })
    }

    /// Open positions as of the last successful pull.
    pub fn snapshot(&self) -> Vec<Position> {
        self.snapshot.read().clone()
    }

    /// Current loop state; `Stopped(Cancelled)` once stopped.
    pub fn state(&self) -> LoopState {
        self.handle
            .as_ref()
            .map(WatchHandle::state)
            .unwrap_or(LoopState::Stopped(StopReason::Cancelled))
    }

    pub fn subscribe_state(&self) -> Option<watch::Receiver<LoopState>> {
        self.handle.as_ref().map(WatchHandle::subscribe)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.state().is_stopped())
    }

    /// Cancels the loop. Returns its handle the first time only.
    pub fn stop(&mut self) -> Option<WatchHandle> {
        let handle = self.handle.take()?;
        handle.cancel();
        self.snapshot.write().clear();
        info!("Stopped position watcher");
        Some(handle)
    }
}

impl Drop for PositionWatcher {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for PositionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionWatcher")
            .field("state", &self.state())
            .field("open_positions", &self.snapshot.read().len())
            .finish()
    }
}

// ============ Watch loop ============

struct PositionLoop {
    session: Arc<dyn ExchangeSession>,
    sink: Arc<dyn UpdateSink>,
    snapshot: Arc<RwLock<Vec<Position>>>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    state: watch::Sender<LoopState>,
}

async fn run_position_loop(ctx: PositionLoop) {
    let PositionLoop {
        session,
        sink,
        snapshot,
        policy,
        cancel,
        state,
    } = ctx;

    let exchange = session.exchange_id().to_string();
    let mut attempt = 0u32;

    let reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }

        state.send_replace(LoopState::Streaming);
        let result = session.stream_positions().await;

        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }

        match result {
            Ok(positions) => {
                attempt = 0;
                let open = open_positions(positions);
                debug!("[{}] {} open positions", exchange, open.len());

                if !apply_positions(&snapshot, &cancel, open, sink.as_ref()) {
                    break StopReason::Cancelled;
                }
            }
            Err(e) => {
                let class = classify(&e);
                let Some(wait) = policy.for_positions(class) else {
                    error!("[{}] Position watching stopped ({:?}): {}", exchange, class, e);
                    sink.publish(DisplayEvent::notice(
                        NoticeLevel::Error,
                        format!("Position watching stopped: {}", e),
                    ));
                    break StopReason::Fatal(e.to_string());
                };

                attempt += 1;
                warn!(
                    "[{}] Error watching positions (attempt {}, {:?}), retrying in {:?}: {}",
                    exchange, attempt, class, wait, e
                );
                state.send_replace(LoopState::SuspendedRetry { attempt, wait });

                if backoff(&cancel, wait).await {
                    break StopReason::Cancelled;
                }
            }
        }
    };

    debug!("[{}] Position loop exited: {:?}", exchange, reason);
    state.send_replace(LoopState::Stopped(reason));
}

/// Stores and publishes `open` unless the loop was cancelled.
///
/// Cancellation is checked under the write lock: `stop` cancels before it
/// clears the snapshot, so a cancelled loop can never publish after the
/// empty array that follows a teardown.
fn apply_positions(
    snapshot: &RwLock<Vec<Position>>,
    cancel: &CancellationToken,
    open: Vec<Position>,
    sink: &dyn UpdateSink,
) -> bool {
    let mut current = snapshot.write();
    if cancel.is_cancelled() {
        return false;
    }
    sink.publish(DisplayEvent::positions(&open));
    *current = open;
    true
}
