//! The indexer: schema, reads, the view registry and the recompute scheduler.
//!
//! Every base change flows through [`Indexer::apply_diff`]. The real delta of
//! each touched table is handed to the views reading it; views run round by
//! round in registration order, and every view whose output changed hands its
//! own delta on to the views reading it, until nothing is left to run.

use crate::config::{ExecutionMode, IndexerConfig};
use crate::report::{ApplyReport, Diagnostic};
use crate::view::{ViewDefinition, ViewEntry};
use cairn_core::{Error, Fact, Result};
use cairn_query::{FunctionRegistry, Query, Union};
use cairn_storage::{
    merge_input, Changeset, FieldIndex, InputChanges, Keys, ProvenanceLedger, Store, Table, TableDelta,
    TableKind,
};
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Work left for one apply.
#[derive(Default)]
struct Schedule {
    /// Unconsumed input changes per view.
    pending: HashMap<String, InputChanges>,
    /// Views to run next round, by registration order.
    queued: BTreeSet<(u64, String)>,
    /// Views that must run from scratch.
    full: HashSet<String>,
    executed: HashSet<String>,
}

/// An incremental relational engine over named fact tables.
///
/// ```rust
/// use cairn_core::fact;
/// use cairn_database::Indexer;
/// use cairn_storage::Changeset;
///
/// let mut indexer = Indexer::new();
/// indexer.add_table("people", &["name", "age"]).unwrap();
///
/// let mut changes = Changeset::new();
/// changes.add("people", fact! { "name" => "Amy", "age" => 30 });
/// indexer.apply_diff(changes).unwrap();
///
/// let amy = indexer.find_one("people", &fact! { "name" => "Amy" }).unwrap();
/// assert_eq!(amy.get("age").and_then(|v| v.as_i64()), Some(30));
/// ```
pub struct Indexer {
    store: Store,
    registry: FunctionRegistry,
    views: HashMap<String, ViewEntry>,
    next_seq: u64,
    config: IndexerConfig,
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer {
    /// Creates an empty indexer with the builtin functions.
    pub fn new() -> Self {
        Self::with_registry(FunctionRegistry::with_builtins(), IndexerConfig::default())
    }

    /// Creates an empty indexer with the builtin functions and `config`.
    pub fn with_config(config: IndexerConfig) -> Self {
        Self::with_registry(FunctionRegistry::with_builtins(), config)
    }

    /// Creates an empty indexer resolving functions from `registry`.
    pub fn with_registry(registry: FunctionRegistry, config: IndexerConfig) -> Self {
        Self {
            store: Store::new(),
            registry,
            views: HashMap::new(),
            next_seq: 0,
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Returns the function registry.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Mutable access to the function registry. Views already registered keep
    /// the functions they were compiled with.
    pub fn registry_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.registry
    }

    // ---------------------------------------------------------------------
    // Schema
    // ---------------------------------------------------------------------

    /// Registers a base table or changes its key fields.
    ///
    /// An empty key list identifies facts by their whole content. Re-keying
    /// keeps the first of any facts that collide under the new keys and
    /// propagates the change to the views reading the table.
    pub fn add_table(&mut self, name: &str, keys: &[&str]) -> Result<ApplyReport> {
        let keys = Keys::from_fields(keys.iter().copied());
        let mut report = ApplyReport::default();
        let delta = match self.store.table_mut(name) {
            Some(table) if table.is_derived() => {
                warn!(table = name, "rejected schema change on derived table");
                return Err(Error::DerivedTableWrite {
                    table: name.to_string(),
                });
            }
            Some(table) => table.set_keys(keys),
            None => {
                debug!(table = name, "registered table");
                self.store.create_table(name, TableKind::Base, keys);
                return Ok(report);
            }
        };
        if !delta.is_empty() {
            debug!(table = name, removed = delta.removed(), "re-keyed table");
            let mut schedule = Schedule::default();
            self.enqueue_dependents(&mut schedule, name, &delta);
            self.propagate(schedule, &mut report)?;
        }
        Ok(report)
    }

    /// Returns the secondary index of `table` over `fields`, creating and
    /// back-filling it if needed.
    pub fn index(&mut self, table: &str, fields: &[&str]) -> Result<&FieldIndex> {
        let table = self
            .store
            .table_mut(table)
            .ok_or_else(|| Error::table_not_found(table))?;
        Ok(table.ensure_index(fields.iter().copied()))
    }

    // ---------------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------------

    /// Applies `changes` to the base tables and brings every view up to date.
    ///
    /// Writes to derived tables are rejected before anything is mutated.
    /// Unknown tables are created with content keys. A view that fails is
    /// detached and reported in [`ApplyReport::diagnostics`]; the rest of the
    /// apply goes through.
    pub fn apply_diff(&mut self, changes: Changeset) -> Result<ApplyReport> {
        for table in changes.table_names() {
            if self.store.table(table).is_some_and(Table::is_derived) {
                warn!(table, "rejected write to derived table");
                return Err(Error::DerivedTableWrite {
                    table: table.to_string(),
                });
            }
        }

        let mut report = ApplyReport::default();
        let mut schedule = Schedule::default();
        for (name, diff) in changes {
            if diff.is_empty() {
                continue;
            }
            if !self.store.has_table(&name) {
                debug!(table = %name, "created table on first write");
                self.store.create_table(&name, TableKind::Base, Keys::Content);
            }

            let mut removes = diff.removes;
            for pattern in &diff.remove_patterns {
                removes.extend(self.store.find(&name, pattern).into_iter().map(|f| (*f).clone()));
            }
            let Some(table) = self.store.table_mut(&name) else {
                continue;
            };
            let delta = table.apply(diff.adds, removes);
            if delta.is_empty() {
                continue;
            }

            trace!(table = %name, added = delta.added(), removed = delta.removed(), "applied base changes");
            report
                .applied
                .add_many(&name, delta.adds.iter().map(|(_, f)| (**f).clone()))
                .remove_facts(&name, delta.removes.iter().map(|(_, f)| (**f).clone()));
            self.enqueue_dependents(&mut schedule, &name, &delta);
        }

        self.propagate(schedule, &mut report)?;
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Views
    // ---------------------------------------------------------------------

    /// Registers `query` as the view `name`, or replaces the definition of an
    /// existing view, and populates its table.
    pub fn register_query(&mut self, name: &str, query: Query) -> Result<ApplyReport> {
        self.install(name, ViewDefinition::Query(query))
    }

    /// Registers `union` as the view `name`, or replaces the definition of an
    /// existing view, and populates its table.
    pub fn register_union(&mut self, name: &str, union: Union) -> Result<ApplyReport> {
        self.install(name, ViewDefinition::Union(union))
    }

    /// Rewrites the query of view `name` with `edit` and recomputes it.
    pub fn update_query(&mut self, name: &str, edit: impl FnOnce(Query) -> Query) -> Result<ApplyReport> {
        let current = match self.views.get(name).map(|e| &e.definition) {
            Some(ViewDefinition::Query(query)) => query.clone(),
            Some(ViewDefinition::Union(_)) => {
                return Err(Error::invalid_operation(format!("view {} is a union", name)))
            }
            None => return Err(Error::view_not_found(name)),
        };
        self.install(name, ViewDefinition::Query(edit(current)))
    }

    /// Rewrites the union of view `name` with `edit` and recomputes it.
    pub fn update_union(&mut self, name: &str, edit: impl FnOnce(Union) -> Union) -> Result<ApplyReport> {
        let current = match self.views.get(name).map(|e| &e.definition) {
            Some(ViewDefinition::Union(union)) => union.clone(),
            Some(ViewDefinition::Query(_)) => {
                return Err(Error::invalid_operation(format!("view {} is a query", name)))
            }
            None => return Err(Error::view_not_found(name)),
        };
        self.install(name, ViewDefinition::Union(edit(current)))
    }

    /// Deletes view `name` with its table and provenance.
    ///
    /// Fails if another view reads it.
    pub fn remove_view(&mut self, name: &str) -> Result<()> {
        let Some(entry) = self.views.get(name) else {
            return Err(Error::view_not_found(name));
        };
        let dependents: Vec<String> = self
            .store
            .table(name)
            .map(|t| t.dependents().iter().filter(|d| *d != name).cloned().collect())
            .unwrap_or_default();
        if !dependents.is_empty() {
            warn!(view = name, ?dependents, "refused to remove view in use");
            return Err(Error::ViewInUse {
                name: name.to_string(),
                dependents,
            });
        }

        for table in entry.reads() {
            if let Some(t) = self.store.table_mut(&table) {
                t.remove_dependent(name);
            }
        }
        self.store.drop_table(name);
        self.views.remove(name);
        debug!(view = name, "removed view");
        Ok(())
    }

    fn install(&mut self, name: &str, definition: ViewDefinition) -> Result<ApplyReport> {
        let existing = self.views.get(name);
        if existing.is_none() && self.store.has_table(name) {
            return Err(Error::invalid_operation(format!("table {} already exists", name)));
        }

        let plan = definition.compile(&self.store, &self.registry).map_err(|err| {
            warn!(view = name, error = %err, "view failed to compile");
            Error::compile(name, err)
        })?;

        let (seq, previous) = match existing {
            Some(entry) => (entry.seq, entry.reads()),
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                (seq, Vec::new())
            }
        };
        for table in previous {
            if let Some(t) = self.store.table_mut(&table) {
                t.remove_dependent(name);
            }
        }

        self.store.create_table(name, TableKind::Derived, Keys::Content);
        for table in plan.reads() {
            if let Some(t) = self.store.table_mut(table) {
                t.add_dependent(name);
            }
        }
        for (table, fields) in plan.index_requests() {
            if let Some(t) = self.store.table_mut(&table) {
                t.ensure_index(fields);
            }
        }
        self.views.insert(
            name.to_string(),
            ViewEntry {
                seq,
                definition,
                plan: Some(plan),
            },
        );
        debug!(view = name, seq, "registered view");

        let mut report = ApplyReport::default();
        let mut schedule = Schedule::default();
        schedule.queued.insert((seq, name.to_string()));
        schedule.full.insert(name.to_string());
        self.propagate(schedule, &mut report)?;
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    fn enqueue_dependents(&self, schedule: &mut Schedule, table: &str, delta: &TableDelta) {
        let Some(t) = self.store.table(table) else {
            return;
        };
        for view in t.dependents() {
            let Some(entry) = self.views.get(view) else {
                continue;
            };
            let inputs = schedule.pending.entry_ref(view.as_str()).or_default();
            merge_input(inputs, table, delta.clone());
            schedule.queued.insert((entry.seq, view.clone()));
        }
    }

    /// Views reachable from `roots` through the tables they write.
    fn reachable<'a>(&self, roots: impl Iterator<Item = &'a str>) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = roots.map(str::to_string).collect();
        while let Some(view) = stack.pop() {
            if !seen.insert(view.clone()) {
                continue;
            }
            if let Some(table) = self.store.table(&view) {
                stack.extend(table.dependents().iter().filter(|d| !seen.contains(*d)).cloned());
            }
        }
        seen
    }

    /// Runs queued views until nothing changes.
    fn propagate(&mut self, mut schedule: Schedule, report: &mut ApplyReport) -> Result<()> {
        let invalidated = self.reachable(schedule.queued.iter().map(|(_, v)| v.as_str()));
        let mut round = 0;
        loop {
            if schedule.queued.is_empty() {
                for name in &invalidated {
                    if schedule.executed.contains(name) {
                        continue;
                    }
                    if let Some(entry) = self.views.get(name).filter(|e| e.is_attached()) {
                        schedule.queued.insert((entry.seq, name.clone()));
                        schedule.full.insert(name.clone());
                    }
                }
                if schedule.queued.is_empty() {
                    break;
                }
            }
            if round >= self.config.max_rounds {
                let pending: Vec<String> = schedule.queued.iter().map(|(_, v)| v.clone()).collect();
                warn!(rounds = round, ?pending, "recompute did not reach a fixpoint");
                report.rounds += round;
                return Err(Error::Diverged { rounds: round, pending });
            }

            round += 1;
            debug!(round, views = schedule.queued.len(), "scheduling round");
            let batch = std::mem::take(&mut schedule.queued);
            for (_, name) in batch {
                let inputs = schedule.pending.remove(&name).unwrap_or_default();
                let full = schedule.full.remove(&name);
                schedule.executed.insert(name.clone());

                let delta = match self.execute(&name, &inputs, full) {
                    Ok(Some(delta)) => delta,
                    Ok(None) => continue,
                    Err(err) => {
                        self.detach(&name, &err, report);
                        continue;
                    }
                };
                if delta.is_empty() {
                    continue;
                }
                trace!(view = %name, added = delta.added(), removed = delta.removed(), "view changed");
                report.record(&name, delta.added(), delta.removed());
                self.enqueue_dependents(&mut schedule, &name, &delta);
            }
        }
        report.rounds += round;
        Ok(())
    }

    /// Runs one view and commits its output. `None` if the view is detached.
    fn execute(&mut self, name: &str, inputs: &InputChanges, full: bool) -> Result<Option<TableDelta>> {
        let Some(plan) = self.views.get(name).and_then(|e| e.plan.clone()) else {
            return Ok(None);
        };
        let full = full || self.config.mode == ExecutionMode::Full || !plan.supports_incremental();
        let delta = if full {
            let rows = plan.execute_full(&self.store)?;
            self.store.commit_full(name, rows)
        } else {
            let output = plan.execute_incremental(&self.store, inputs)?;
            self.store.commit_delta(name, output)
        };
        Ok(Some(delta))
    }

    /// Unhooks a failed view from its inputs. Its table keeps its last
    /// content as a frozen snapshot with no provenance.
    fn detach(&mut self, name: &str, err: &Error, report: &mut ApplyReport) {
        warn!(view = name, error = %err, "detached view");
        self.store.clear_provenance(name);
        let reads = self.views.get(name).map(ViewEntry::reads).unwrap_or_default();
        for table in reads {
            if let Some(t) = self.store.table_mut(&table) {
                t.remove_dependent(name);
            }
        }
        if let Some(entry) = self.views.get_mut(name) {
            entry.plan = None;
        }
        report.diagnostics.push(Diagnostic {
            view: name.to_string(),
            message: err.to_string(),
        });
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Facts of `table` matching `pattern`. Unknown tables yield nothing.
    pub fn find(&self, table: &str, pattern: &Fact) -> Vec<Rc<Fact>> {
        self.store.find(table, pattern)
    }

    /// First fact of `table` matching `pattern`.
    pub fn find_one(&self, table: &str, pattern: &Fact) -> Option<Rc<Fact>> {
        self.store.find_one(table, pattern)
    }

    /// Every fact of `table`.
    pub fn facts(&self, table: &str) -> Vec<Rc<Fact>> {
        self.store.find(table, &Fact::new())
    }

    /// Returns a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.store.table(name)
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns the provenance ledger.
    pub fn provenance(&self) -> &ProvenanceLedger {
        self.store.provenance()
    }

    /// Definition of view `name`.
    pub fn definition(&self, name: &str) -> Option<&ViewDefinition> {
        self.views.get(name).map(|e| &e.definition)
    }

    /// Names of all views in registration order.
    pub fn view_names(&self) -> Vec<&str> {
        let mut views: Vec<(&u64, &str)> = self.views.iter().map(|(n, e)| (&e.seq, n.as_str())).collect();
        views.sort();
        views.into_iter().map(|(_, n)| n).collect()
    }

    /// Names of views detached after a failure, in registration order.
    pub fn detached_views(&self) -> Vec<&str> {
        self.view_names()
            .into_iter()
            .filter(|n| self.views.get(*n).is_some_and(|e| !e.is_attached()))
            .collect()
    }
}
