//! Change detection for ticker updates.

use crate::events::Ticker;

/// Whether `new` differs from `old` in a way the display should see.
///
/// Only the last price and the percentage change are compared, exactly.
/// The very first value after a subscription is always delivered, even if
/// it happens to match the placeholder.
pub fn is_update_warranted(old: &Ticker, new: &Ticker, delivered: bool) -> bool {
    if !delivered {
        return true;
    }
    old.last != new.last || old.percentage != new.percentage
}
