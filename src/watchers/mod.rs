//! Watcher subsystems for market monitoring.
//!
//! Each watcher runs its loops as independent tokio tasks against a shared
//! `ExchangeSession` and publishes normalized `DisplayEvent`s. Loops are
//! stopped cooperatively through a per-loop cancellation token.

mod change;
mod position_watcher;
mod state;
mod ticker_watcher;

pub use change::is_update_warranted;
pub use position_watcher::PositionWatcher;
pub use state::{LoopState, StopReason, WatchHandle};
pub use ticker_watcher::{SubscribeError, SubscriptionManager};
