//! Watch loop lifecycle.
//!
//! Every loop moves through
//! `Idle → Streaming → (SuspendedRetry → Streaming)* → Stopped`.
//! The current state is published on a `watch` channel so owners (and
//! tests) can observe transitions without polling shared maps.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Why a loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The owner cancelled the loop.
    Cancelled,
    /// A non-retryable failure; the message was surfaced to the user.
    Fatal(String),
}

/// State of a single watch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    /// Blocked inside the exchange's streaming pull.
    Streaming,
    /// Waiting out a backoff after a failed pull.
    SuspendedRetry { attempt: u32, wait: Duration },
    Stopped(StopReason),
}

impl LoopState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, LoopState::Stopped(_))
    }
}

/// Owner's side of a spawned watch loop.
pub struct WatchHandle {
    label: String,
    cancel: CancellationToken,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub(crate) fn new(
        label: impl Into<String>,
        cancel: CancellationToken,
        state: watch::Receiver<LoopState>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            label: label.into(),
            cancel,
            state,
            task,
        }
    }

    /// Symbol, or `positions`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Signals the loop to stop at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> LoopState {
        self.state.borrow().clone()
    }

    /// A receiver that follows every state transition.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop task to exit and returns its final state.
    pub async fn stopped(self) -> LoopState {
        let Self { state, task, .. } = self;
        // A panicked loop never wrote its final state.
        if task.await.is_err() {
            return panicked();
        }
        let final_state = state.borrow().clone();
        final_state
    }

    /// Cancels the loop and waits up to `grace` for it to exit. A loop
    /// still stuck in its pull after that is aborted.
    pub async fn stop_within(mut self, grace: Duration) -> LoopState {
        self.cancel.cancel();
        let final_state = match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => self.state.borrow().clone(),
            Ok(Err(_)) => panicked(),
            Err(_) => {
                warn!("[{}] Watch loop did not stop within {:?}, aborting", self.label, grace);
                self.task.abort();
                LoopState::Stopped(StopReason::Cancelled)
            }
        };
        final_state
    }
}

fn panicked() -> LoopState {
    LoopState::Stopped(StopReason::Fatal("watch loop panicked".to_string()))
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("label", &self.label)
            .field("state", &*self.state.borrow())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Sleeps for `wait` unless cancelled first. Returns true if cancelled.
pub(crate) async fn backoff(cancel: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(wait) => false,
    }
}
