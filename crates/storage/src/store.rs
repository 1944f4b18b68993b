//! Multi-table store.
//!
//! The `Store` owns every table and the provenance ledger, and commits the
//! output of view executions into derived tables.

use crate::delta::TableDelta;
use crate::provenance::{InstanceId, ProvenanceLedger, SourceRef};
use crate::table::{Keys, Table, TableKind};
use cairn_core::{Fact, FactId};
use hashbrown::HashSet;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::trace;

/// One row-instance produced by a view.
#[derive(Clone, Debug)]
pub struct DerivedRow {
    /// The emitted fact.
    pub fact: Fact,
    /// Instance identity.
    pub instance: InstanceId,
    /// Source facts of the instance.
    pub sources: Vec<SourceRef>,
}

/// Output of an incremental view execution.
#[derive(Clone, Debug, Default)]
pub struct DerivedDelta {
    /// New row-instances.
    pub adds: Vec<DerivedRow>,
    /// Sources whose instances must be retracted.
    pub retracted: Vec<SourceRef>,
}

impl DerivedDelta {
    /// Returns true if the execution produced nothing.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.retracted.is_empty()
    }
}

/// All tables plus provenance.
#[derive(Debug, Default, Clone)]
pub struct Store {
    tables: BTreeMap<String, Table>,
    provenance: ProvenanceLedger,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Returns a mutable table by name.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Returns true if the table exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Creates a table, or returns the existing one unchanged.
    pub fn create_table(&mut self, name: &str, kind: TableKind, keys: Keys) -> &mut Table {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| Table::new(name, kind, keys))
    }

    /// Drops a table and its provenance.
    pub fn drop_table(&mut self, name: &str) -> Option<Table> {
        self.provenance.clear_table(name);
        self.tables.remove(name)
    }

    /// Table names in order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Iterates tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Returns the facts of `table` matching `pattern`. Unknown tables yield nothing.
    pub fn find(&self, table: &str, pattern: &Fact) -> Vec<Rc<Fact>> {
        self.tables
            .get(table)
            .map(|t| t.lookup(pattern).into_iter().map(|(_, f)| f).collect())
            .unwrap_or_default()
    }

    /// Returns the first fact of `table` matching `pattern`.
    pub fn find_one(&self, table: &str, pattern: &Fact) -> Option<Rc<Fact>> {
        self.find(table, pattern).into_iter().next()
    }

    /// Returns the provenance ledger.
    pub fn provenance(&self) -> &ProvenanceLedger {
        &self.provenance
    }

    /// Forgets the provenance of a derived table, keeping its content.
    pub fn clear_provenance(&mut self, table: &str) {
        self.provenance.clear_table(table);
    }

    /// Returns true if the source fact is present and, for derived facts,
    /// transitively backed by base facts.
    pub fn is_supported(&self, source: &SourceRef) -> bool {
        let mut visiting = HashSet::new();
        self.supported(source, &mut visiting)
    }

    fn supported(&self, source: &SourceRef, visiting: &mut HashSet<SourceRef>) -> bool {
        let Some(table) = self.tables.get(&source.table) else {
            return false;
        };
        if !table.contains(&source.id) {
            return false;
        }
        if !table.is_derived() {
            return true;
        }
        if !visiting.insert(source.clone()) {
            return false;
        }
        let supported = self
            .provenance
            .instances(&source.table, &source.id)
            .any(|sources| sources.iter().all(|s| self.supported(s, visiting)));
        visiting.remove(source);
        supported
    }

    /// Replaces the content and provenance of a derived table with a full
    /// execution's output. Returns the real delta.
    pub fn commit_full(&mut self, table: &str, rows: Vec<DerivedRow>) -> TableDelta {
        self.provenance.clear_table(table);
        let mut next: BTreeMap<FactId, Rc<Fact>> = BTreeMap::new();
        for row in rows {
            let id = FactId::of_content(&row.fact);
            self.provenance.record(table, id, row.instance, row.sources);
            next.entry(id).or_insert_with(|| Rc::new(row.fact));
        }
        let delta = match self.tables.get_mut(table) {
            Some(t) => t.replace_content(next),
            None => TableDelta::new(),
        };
        trace!(table, added = delta.added(), removed = delta.removed(), "committed full output");
        delta
    }

    /// Folds an incremental execution's output into a derived table.
    ///
    /// Retractions run before additions, so a source that was removed and
    /// re-added within the same input keeps its instances.
    pub fn commit_delta(&mut self, table: &str, output: DerivedDelta) -> TableDelta {
        let mut orphaned: Vec<FactId> = Vec::new();
        for source in &output.retracted {
            for id in self.provenance.retract_source(table, source) {
                if !orphaned.contains(&id) {
                    orphaned.push(id);
                }
            }
        }

        let mut fresh: Vec<(FactId, Fact)> = Vec::new();
        for row in output.adds {
            let id = FactId::of_content(&row.fact);
            self.provenance.record(table, id, row.instance, row.sources);
            fresh.push((id, row.fact));
        }

        let mut delta = TableDelta::new();
        let Some(t) = self.tables.get_mut(table) else {
            return delta;
        };
        for id in orphaned {
            if self.provenance.instance_count(table, &id) == 0 {
                if let Some(old) = t.remove(&id) {
                    delta.removes.push((id, old));
                }
            }
        }
        for (id, fact) in fresh {
            let fact = Rc::new(fact);
            if t.insert(id, Rc::clone(&fact)) {
                delta.adds.push((id, fact));
            }
        }
        trace!(table, added = delta.added(), removed = delta.removed(), "committed incremental output");
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::fact;

    fn base(store: &mut Store, name: &str, facts: Vec<Fact>) -> Vec<FactId> {
        let table = store.create_table(name, TableKind::Base, Keys::Content);
        let delta = table.apply(facts, vec![]);
        delta.adds.iter().map(|(id, _)| *id).collect()
    }

    fn row(fact: Fact, salt: u64, sources: Vec<SourceRef>) -> DerivedRow {
        DerivedRow {
            fact,
            instance: InstanceId::from_sources(salt, &sources),
            sources,
        }
    }

    #[test]
    fn test_find_unknown_table_is_empty() {
        let store = Store::new();
        assert!(store.find("nope", &Fact::new()).is_empty());
        assert!(store.find_one("nope", &Fact::new()).is_none());
    }

    #[test]
    fn test_commit_full_replaces_content() {
        let mut store = Store::new();
        let ids = base(&mut store, "a", vec![fact! { "n" => 1 }, fact! { "n" => 2 }]);
        store.create_table("v", TableKind::Derived, Keys::Content);

        let rows = ids
            .iter()
            .map(|id| row(fact! { "k" => "x" }, 0, vec![SourceRef::new("a", *id)]))
            .collect();
        let delta = store.commit_full("v", rows);
        // two instances coalesce into one fact
        assert_eq!(delta.added(), 1);
        assert_eq!(store.table("v").map(Table::len), Some(1));
        assert_eq!(store.provenance().len(), 2);

        let delta = store.commit_full("v", vec![]);
        assert_eq!(delta.removed(), 1);
        assert!(store.provenance().is_empty());
    }

    #[test]
    fn test_commit_delta_retracts_only_unsupported() {
        let mut store = Store::new();
        let ids = base(&mut store, "a", vec![fact! { "n" => 1 }, fact! { "n" => 2 }]);
        store.create_table("v", TableKind::Derived, Keys::Content);

        let adds = ids
            .iter()
            .map(|id| row(fact! { "k" => "x" }, 0, vec![SourceRef::new("a", *id)]))
            .collect();
        let delta = store.commit_delta("v", DerivedDelta { adds, retracted: vec![] });
        assert_eq!(delta.added(), 1);

        let first = SourceRef::new("a", ids[0]);
        let delta = store.commit_delta("v", DerivedDelta { adds: vec![], retracted: vec![first] });
        assert!(delta.is_empty());

        let second = SourceRef::new("a", ids[1]);
        let delta = store.commit_delta("v", DerivedDelta { adds: vec![], retracted: vec![second] });
        assert_eq!(delta.removed(), 1);
        assert!(store.table("v").is_some_and(Table::is_empty));
    }

    #[test]
    fn test_is_supported_walks_upstream() {
        let mut store = Store::new();
        let ids = base(&mut store, "a", vec![fact! { "n" => 1 }]);
        let source = SourceRef::new("a", ids[0]);
        assert!(store.is_supported(&source));

        store.create_table("v", TableKind::Derived, Keys::Content);
        store.commit_full("v", vec![row(fact! { "n" => 1 }, 0, vec![source.clone()])]);
        let derived_id = FactId::of_content(&fact! { "n" => 1 });
        let derived = SourceRef::new("v", derived_id);
        assert!(store.is_supported(&derived));

        // base fact disappears without the view being refreshed
        if let Some(t) = store.table_mut("a") {
            t.remove(&ids[0]);
        }
        assert!(!store.is_supported(&source));
        assert!(!store.is_supported(&derived));
    }

    #[test]
    fn test_is_supported_rejects_cycles() {
        let mut store = Store::new();
        store.create_table("v", TableKind::Derived, Keys::Content);
        let f = fact! { "n" => 1 };
        let id = FactId::of_content(&f);
        let me = SourceRef::new("v", id);
        store.commit_full("v", vec![row(f, 0, vec![me.clone()])]);
        assert!(!store.is_supported(&me));
    }

    #[test]
    fn test_drop_table_clears_provenance() {
        let mut store = Store::new();
        let ids = base(&mut store, "a", vec![fact! { "n" => 1 }]);
        store.create_table("v", TableKind::Derived, Keys::Content);
        store.commit_full("v", vec![row(fact! { "n" => 1 }, 0, vec![SourceRef::new("a", ids[0])])]);
        assert!(store.drop_table("v").is_some());
        assert!(store.provenance().is_empty());
        assert!(!store.has_table("v"));
    }
}
