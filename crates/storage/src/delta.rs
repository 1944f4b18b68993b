//! Real per-table deltas.
//!
//! A `TableDelta` is the effective change a table went through: facts that
//! were actually added and facts that were actually removed, by id.

use cairn_core::{Fact, FactId};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Effective change to one table.
#[derive(Clone, Debug, Default)]
pub struct TableDelta {
    /// Facts that became present.
    pub adds: Vec<(FactId, Rc<Fact>)>,
    /// Facts that stopped being present.
    pub removes: Vec<(FactId, Rc<Fact>)>,
}

/// Pending input changes of a view, keyed by the table they happened in.
pub type InputChanges = BTreeMap<String, TableDelta>;

impl TableDelta {
    /// Creates an empty delta.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing changed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty()
    }

    /// Number of added facts.
    #[inline]
    pub fn added(&self) -> usize {
        self.adds.len()
    }

    /// Number of removed facts.
    #[inline]
    pub fn removed(&self) -> usize {
        self.removes.len()
    }

    /// Folds a later delta into this one.
    ///
    /// A later removal of a fact this delta added cancels the pair; a later
    /// re-add of a removed fact is kept alongside the removal.
    pub fn merge(&mut self, later: TableDelta) {
        for (id, fact) in later.removes {
            if let Some(pos) = self.adds.iter().position(|(a, _)| *a == id) {
                self.adds.swap_remove(pos);
            } else {
                self.removes.push((id, fact));
            }
        }
        for (id, fact) in later.adds {
            if !self.adds.iter().any(|(a, _)| *a == id) {
                self.adds.push((id, fact));
            }
        }
    }

    /// Swaps adds and removes.
    pub fn reversed(&self) -> Self {
        Self {
            adds: self.removes.clone(),
            removes: self.adds.clone(),
        }
    }
}

/// Merges `delta` into the changes pending for `table`.
pub fn merge_input(changes: &mut InputChanges, table: &str, delta: TableDelta) {
    match changes.get_mut(table) {
        Some(existing) => existing.merge(delta),
        None => {
            changes.insert(table.to_string(), delta);
        }
    }
}
