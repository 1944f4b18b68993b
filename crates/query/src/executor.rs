//! Query execution.
//!
//! Stage operators run breadth-wise: every candidate row passes through stage
//! `i` before any row enters stage `i + 1`. Incremental runs pin select stages
//! to the added facts and to the join roots reached by walking backwards from
//! them.

use crate::compile::{QueryPlan, StageRole};
use crate::plan::ViewPlan;
use crate::row::{ExecContext, JoinRow, Pins};
use cairn_core::{Error, Fact, FactId, Result, Value};
use cairn_storage::{DerivedDelta, DerivedRow, InputChanges, InstanceId, SourceRef, Store};
use std::rc::Rc;
use tracing::trace;

impl QueryPlan {
    fn run(&self, store: &Store, pins: &Pins) -> Result<Vec<JoinRow>> {
        let ctx = ExecContext { store, pins };
        let mut rows = vec![JoinRow::new(self.stage_count())];
        for op in &self.ops {
            let mut next = Vec::new();
            for row in &rows {
                op(&ctx, row, &mut next)?;
            }
            rows = next;
            if rows.is_empty() {
                break;
            }
        }
        Ok(rows)
    }

    fn emit(&self, row: &JoinRow) -> Option<DerivedRow> {
        let mut sources = Vec::new();
        for (stage, role) in self.roles.iter().enumerate() {
            if *role != StageRole::Select {
                continue;
            }
            if let (Some((id, _)), Some(table)) = (row.fact(stage), &self.tables[stage]) {
                sources.push(SourceRef::new(table.as_str(), id));
            }
        }

        let fact = match &self.projection {
            Some(fields) => {
                let mut fact = Fact::new();
                for (name, accessor) in fields {
                    fact.insert(name.as_str(), accessor(row)?);
                }
                fact
            }
            None => self.raw_fact(row),
        };

        Some(DerivedRow {
            fact,
            instance: InstanceId::from_sources(self.expansion_salt(row), &sources),
            sources,
        })
    }

    /// Distinguishes rows fanned out from the same sources.
    fn expansion_salt(&self, row: &JoinRow) -> u64 {
        if self.expansions.is_empty() {
            return 0;
        }
        let mut hasher = blake3::Hasher::new();
        for stage in &self.expansions {
            match row.value(*stage) {
                Some(value) => value.write_canonical(&mut hasher),
                None => Value::Null.write_canonical(&mut hasher),
            }
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    /// The join row with select fields namespaced as `label.field`.
    fn raw_fact(&self, row: &JoinRow) -> Fact {
        let mut fact = Fact::new();
        for (stage, role) in self.roles.iter().enumerate() {
            let label = &self.labels[stage];
            match role {
                StageRole::Select => {
                    if let Some((_, bound)) = row.fact(stage) {
                        for (field, value) in bound.iter() {
                            fact.insert(format!("{}.{}", label, field), value.clone());
                        }
                    }
                }
                StageRole::Value | StageRole::Aggregate => {
                    if let Some(value) = row.value(stage) {
                        fact.insert(label.as_str(), value.clone());
                    }
                }
                StageRole::Filter | StageRole::Negated => {}
            }
        }
        fact
    }

    /// Root candidates for a run with `stage` pinned to `facts`.
    ///
    /// Follows join links from `stage` back to the first stage. Returns `None`
    /// when some stage on the way has no link, meaning every root is a
    /// candidate.
    fn reverse_roots(&self, store: &Store, stage: usize, facts: &[(FactId, Rc<Fact>)]) -> Option<Vec<(FactId, Rc<Fact>)>> {
        let mut current = stage;
        let mut frontier: Vec<(FactId, Rc<Fact>)> = facts.to_vec();
        while current > 0 {
            let link = self.links[current].iter().min_by_key(|l| current - l.prev_stage)?;
            let table = self.tables[link.prev_stage].as_deref()?;
            let prev = store.table(table)?;

            let mut next: Vec<(FactId, Rc<Fact>)> = Vec::new();
            for (_, fact) in &frontier {
                let Some(value) = fact.get(&link.field) else {
                    continue;
                };
                let pattern = Fact::new().with(link.prev_field.as_str(), value.clone());
                for (id, found) in prev.lookup(&pattern) {
                    if !next.iter().any(|(n, _)| *n == id) {
                        next.push((id, found));
                    }
                }
            }
            frontier = next;
            current = link.prev_stage;
        }
        Some(frontier)
    }
}

impl ViewPlan for QueryPlan {
    fn reads(&self) -> &[String] {
        &self.reads
    }

    fn supports_incremental(&self) -> bool {
        self.incremental
    }

    fn index_requests(&self) -> Vec<(String, Vec<String>)> {
        self.index_requests.clone()
    }

    fn execute_full(&self, store: &Store) -> Result<Vec<DerivedRow>> {
        let mut rows = self.run(store, &Pins::new())?;
        if let Some(post) = &self.post {
            rows = post.apply(rows)?;
        }
        let out: Vec<DerivedRow> = rows.iter().filter_map(|row| self.emit(row)).collect();
        trace!(rows = out.len(), "full query execution");
        Ok(out)
    }

    fn execute_incremental(&self, store: &Store, changes: &InputChanges) -> Result<DerivedDelta> {
        if !self.incremental {
            return Err(Error::invalid_operation(
                "query cannot run incrementally; use a full execution",
            ));
        }

        let mut delta = DerivedDelta::default();
        for (table, change) in changes {
            if !self.reads.contains(table) {
                continue;
            }
            for (id, _) in &change.removes {
                let source = SourceRef::new(table.as_str(), *id);
                if !delta.retracted.contains(&source) {
                    delta.retracted.push(source);
                }
            }
            if change.adds.is_empty() {
                continue;
            }

            for (stage, read) in self.tables.iter().enumerate() {
                if read.as_deref() != Some(table.as_str()) || self.roles[stage] != StageRole::Select {
                    continue;
                }
                let mut pins = Pins::new();
                pins.insert(stage, change.adds.clone());
                if stage > 0 {
                    match self.reverse_roots(store, stage, &change.adds) {
                        Some(roots) if roots.is_empty() => continue,
                        Some(roots) => {
                            pins.insert(0, roots);
                        }
                        None => {}
                    }
                }
                let rows = self.run(store, &pins)?;
                delta.adds.extend(rows.iter().filter_map(|row| self.emit(row)));
            }
        }
        trace!(
            added = delta.adds.len(),
            retracted = delta.retracted.len(),
            "incremental query execution"
        );
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Binding, FieldRef, Limit, SortField};
    use crate::functions::FunctionRegistry;
    use crate::query::Query;
    use cairn_core::{fact, Value};
    use cairn_storage::{Keys, TableDelta, TableKind};

    fn store() -> Store {
        let mut store = Store::new();
        store
            .create_table("people", TableKind::Base, Keys::from_fields(["name"]))
            .apply(
                vec![
                    fact! { "name" => "Amy", "age" => 30 },
                    fact! { "name" => "Bo", "age" => 17 },
                    fact! { "name" => "Cy", "age" => 45 },
                ],
                vec![],
            );
        store
            .create_table("pets", TableKind::Base, Keys::Content)
            .apply(
                vec![
                    fact! { "owner" => "Amy", "pet" => "cat" },
                    fact! { "owner" => "Amy", "pet" => "dog" },
                    fact! { "owner" => "Cy", "pet" => "fish" },
                ],
                vec![],
            );
        store
    }

    fn plan(store: &Store, query: Query) -> QueryPlan {
        query.compile(store, &FunctionRegistry::with_builtins()).unwrap()
    }

    fn names(rows: &[DerivedRow], field: &str) -> Vec<String> {
        let mut out: Vec<String> = rows
            .iter()
            .filter_map(|r| r.fact.get(field).and_then(Value::as_str).map(str::to_string))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_filter_and_project() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![], Some("p"))
                .calculate(">", vec![("a", Binding::field("p", "age")), ("b", Binding::value(21))], None)
                .project(vec![("name", Binding::field("p", "name"))]),
        );
        let rows = p.execute_full(&store).unwrap();
        assert_eq!(names(&rows, "name"), vec!["Amy", "Cy"]);
        assert_eq!(rows[0].sources.len(), 1);
    }

    #[test]
    fn test_join_emits_namespaced_fields() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![], Some("p"))
                .select("pets", vec![("owner", Binding::field("p", "name"))], Some("x")),
        );
        let rows = p.execute_full(&store).unwrap();
        assert_eq!(names(&rows, "x.pet"), vec!["cat", "dog", "fish"]);
        assert!(rows.iter().all(|r| r.fact.contains("p.age") && r.sources.len() == 2));
    }

    #[test]
    fn test_deselect_against_live_content() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![], Some("p"))
                .deselect("pets", vec![("owner", Binding::field("p", "name"))], None)
                .project(vec![("name", Binding::field("p", "name"))]),
        );
        assert_eq!(names(&p.execute_full(&store).unwrap(), "name"), vec!["Bo"]);
    }

    #[test]
    fn test_calculation_result() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![("name", Binding::value("Amy"))], Some("p"))
                .calculate("+", vec![("a", Binding::field("p", "age")), ("b", Binding::value(1))], Some("next"))
                .project(vec![("next", Binding::result("next"))]),
        );
        let rows = p.execute_full(&store).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fact.get("next"), Some(&Value::Int64(31)));
    }

    #[test]
    fn test_expansion_fans_out_rows() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![("name", Binding::value("Amy"))], Some("p"))
                .calculate("range", vec![("from", Binding::value(0)), ("to", Binding::value(3))], Some("n"))
                .project(vec![("name", Binding::field("p", "name")), ("n", Binding::result("n"))]),
        );
        let rows = p.execute_full(&store).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.sources.len() == 1));
    }

    #[test]
    fn test_expanded_rows_are_separate_instances() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![("name", Binding::value("Amy"))], Some("p"))
                .calculate("range", vec![("from", Binding::value(0)), ("to", Binding::value(3))], Some("n"))
                .project(vec![("name", Binding::field("p", "name"))]),
        );
        let rows = p.execute_full(&store).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.fact == rows[0].fact && r.sources == rows[0].sources));
        let mut instances: Vec<InstanceId> = rows.iter().map(|r| r.instance).collect();
        instances.sort();
        instances.dedup();
        assert_eq!(instances.len(), 3);
    }

    #[test]
    fn test_grouped_count() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("pets", vec![], Some("x"))
                .aggregate("count", vec![], Some("n"))
                .group(vec![FieldRef::new("x", "owner")])
                .project(vec![("owner", Binding::field("x", "owner")), ("n", Binding::result("n"))]),
        );
        let rows = p.execute_full(&store).unwrap();
        let amy = rows
            .iter()
            .find(|r| r.fact.get("owner") == Some(&Value::from("Amy")))
            .unwrap();
        assert_eq!(amy.fact.get("n"), Some(&Value::Int64(2)));
    }

    #[test]
    fn test_sort_and_limit() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![], Some("p"))
                .sort(vec![SortField::desc(FieldRef::new("p", "age"))])
                .limit(Limit::new().results(1))
                .project(vec![("name", Binding::field("p", "name"))]),
        );
        let rows = p.execute_full(&store).unwrap();
        assert_eq!(names(&rows, "name"), vec!["Cy"]);
    }

    #[test]
    fn test_incremental_join_walks_back_to_roots() {
        let mut store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![], Some("p"))
                .select("pets", vec![("owner", Binding::field("p", "name"))], Some("x"))
                .project(vec![("name", Binding::field("p", "name")), ("pet", Binding::field("x", "pet"))]),
        );
        let delta = store
            .table_mut("pets")
            .unwrap()
            .apply(vec![fact! { "owner" => "Bo", "pet" => "frog" }], vec![]);
        let mut changes = InputChanges::new();
        changes.insert("pets".to_string(), delta);

        let out = p.execute_incremental(&store, &changes).unwrap();
        assert_eq!(out.adds.len(), 1);
        assert_eq!(out.adds[0].fact.get("name"), Some(&Value::from("Bo")));
        assert!(out.retracted.is_empty());
    }

    #[test]
    fn test_incremental_removes_become_retractions() {
        let mut store = store();
        let p = plan(&store, Query::new().select("people", vec![], Some("p")));
        let delta: TableDelta = store
            .table_mut("people")
            .unwrap()
            .apply(vec![], vec![fact! { "name" => "Bo" }]);
        let mut changes = InputChanges::new();
        changes.insert("people".to_string(), delta);

        let out = p.execute_incremental(&store, &changes).unwrap();
        assert!(out.adds.is_empty());
        assert_eq!(out.retracted.len(), 1);
        assert_eq!(out.retracted[0].table, "people");
    }

    #[test]
    fn test_full_only_plan_rejects_incremental() {
        let store = store();
        let p = plan(
            &store,
            Query::new()
                .select("people", vec![], Some("p"))
                .aggregate("count", vec![], Some("n")),
        );
        assert!(p.execute_incremental(&store, &InputChanges::new()).is_err());
    }
}
