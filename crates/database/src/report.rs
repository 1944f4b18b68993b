//! What an apply or registration did.

use cairn_storage::Changeset;
use std::collections::BTreeMap;
use std::fmt;

/// Net change of one derived table during an apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewDelta {
    /// Facts added.
    pub added: usize,
    /// Facts removed.
    pub removed: usize,
}

/// A view that failed and was detached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Name of the view.
    pub view: String,
    /// The error it failed with.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view {} detached: {}", self.view, self.message)
    }
}

/// Outcome of [`Indexer::apply_diff`](crate::Indexer::apply_diff) and of view
/// registration.
#[derive(Clone, Debug, Default)]
pub struct ApplyReport {
    /// The base changes that actually happened. Reversing it undoes the apply.
    pub applied: Changeset,
    /// Changes per derived table, in view name order.
    pub derived: BTreeMap<String, ViewDelta>,
    /// Scheduling rounds executed.
    pub rounds: usize,
    /// Views detached during the apply.
    pub diagnostics: Vec<Diagnostic>,
}

impl ApplyReport {
    /// Change recorded for `view`, if it changed.
    pub fn view(&self, view: &str) -> Option<ViewDelta> {
        self.derived.get(view).copied()
    }

    /// Returns true if no view failed.
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub(crate) fn record(&mut self, view: &str, added: usize, removed: usize) {
        let entry = self.derived.entry(view.to_string()).or_default();
        entry.added += added;
        entry.removed += removed;
    }
}
