//! Event system for the watchdog.
//!
//! Watchers never talk to the display directly. Every observation is
//! normalized into a `DisplayEvent` and handed to an `UpdateSink`.

mod display_events;
mod market_data;

pub use display_events::{
    ControlCommand,
    DisplayEvent,
    NoticeLevel,
    PositionView,
    SearchResult,
    TickerView,
};
pub use market_data::{
    is_perpetual,
    open_positions,
    MarginMode,
    Position,
    PositionSide,
    Ticker,
};

use tokio::sync::mpsc;
use tracing::debug;

/// Receiver of display updates.
///
/// Implementations must not block: watch loops call `publish` inline.
pub trait UpdateSink: Send + Sync {
    fn publish(&self, event: DisplayEvent);
}

impl UpdateSink for mpsc::UnboundedSender<DisplayEvent> {
    fn publish(&self, event: DisplayEvent) {
        if self.send(event).is_err() {
            debug!("Display receiver dropped, update discarded");
        }
    }
}
