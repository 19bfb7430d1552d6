//! Desired-versus-actual symbol diffing.

use std::collections::BTreeSet;

/// What has to change to get from the watched set to the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolDiff {
    pub to_remove: Vec<String>,
    pub to_add: Vec<String>,
}

impl SymbolDiff {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Symbols only in `actual` are removed, symbols only in `desired` added.
/// Both lists come out sorted.
pub fn diff_symbols<'a>(
    actual: impl IntoIterator<Item = &'a String>,
    desired: &BTreeSet<String>,
) -> SymbolDiff {
    let actual: BTreeSet<&String> = actual.into_iter().collect();

    SymbolDiff {
        to_remove: actual
            .iter()
            .filter(|s| !desired.contains(s.as_str()))
            .map(|s| s.to_string())
            .collect(),
        to_add: desired
            .iter()
            .filter(|s| !actual.contains(s))
            .cloned()
            .collect(),
    }
}

/// Everything one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// The session was torn down and rebuilt.
    pub session_replaced: bool,
    pub removed: Vec<String>,
    pub added: Vec<String>,
    /// Desired symbols the exchange does not list.
    pub rejected: Vec<String>,
    pub positions_started: bool,
}

impl ReconcileReport {
    /// Nothing was changed.
    pub fn is_noop(&self) -> bool {
        !self.session_replaced
            && self.removed.is_empty()
            && self.added.is_empty()
            && !self.positions_started
    }
}
