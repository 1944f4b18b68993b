//! Property-based tests for table maintenance.
//!
//! These tests verify that set semantics, secondary indexes and changeset
//! reversal stay consistent for randomly generated facts.

use cairn_core::{fact, Fact, FactId};
use cairn_storage::{Changeset, Keys, Table, TableKind};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Strategy for facts over a small domain so ids collide often.
fn fact_strategy() -> impl Strategy<Value = Fact> {
    (0i64..8, 0i64..4).prop_map(|(k, g)| fact! { "k" => k, "g" => g })
}

fn ids(table: &Table) -> BTreeSet<FactId> {
    table.iter().map(|(id, _)| *id).collect()
}

proptest! {
    /// Property: adding the same facts twice changes nothing the second time.
    #[test]
    fn apply_is_idempotent(facts in prop::collection::vec(fact_strategy(), 0..30)) {
        let mut table = Table::new("t", TableKind::Base, Keys::Content);
        table.apply(facts.clone(), vec![]);
        let before = ids(&table);

        let delta = table.apply(facts, vec![]);
        prop_assert!(delta.is_empty());
        prop_assert_eq!(ids(&table), before);
    }

    /// Property: applying a real delta in reverse restores the previous content.
    #[test]
    fn reversed_delta_restores_content(
        initial in prop::collection::vec(fact_strategy(), 0..20),
        adds in prop::collection::vec(fact_strategy(), 0..10),
        removes in prop::collection::vec(fact_strategy(), 0..10),
    ) {
        let mut table = Table::new("t", TableKind::Base, Keys::from_fields(["k"]));
        table.apply(initial, vec![]);
        let before: BTreeSet<Fact> = table.iter().map(|(_, f)| (**f).clone()).collect();

        let delta = table.apply(adds, removes);
        let mut applied = Changeset::new();
        applied
            .add_many("t", delta.adds.iter().map(|(_, f)| (**f).clone()))
            .remove_facts("t", delta.removes.iter().map(|(_, f)| (**f).clone()));
        let undo = applied.reverse();
        let diff = undo.get("t").cloned().unwrap_or_default();
        // removals first so a replaced key is freed before its old content returns
        table.apply(vec![], diff.removes);
        table.apply(diff.adds, vec![]);

        let after: BTreeSet<Fact> = table.iter().map(|(_, f)| (**f).clone()).collect();
        prop_assert_eq!(after, before);
    }

    /// Property: index lookups agree with scans after arbitrary changes.
    #[test]
    fn index_agrees_with_scan(
        initial in prop::collection::vec(fact_strategy(), 0..20),
        removes in prop::collection::vec(fact_strategy(), 0..10),
        probe in 0i64..4,
    ) {
        let mut indexed = Table::new("t", TableKind::Base, Keys::Content);
        indexed.ensure_index(["g"]);
        let mut plain = Table::new("t", TableKind::Base, Keys::Content);
        for table in [&mut indexed, &mut plain] {
            table.apply(initial.clone(), vec![]);
            table.apply(vec![], removes.clone());
        }

        let pattern = fact! { "g" => probe };
        let a: BTreeSet<FactId> = indexed.lookup(&pattern).into_iter().map(|(id, _)| id).collect();
        let b: BTreeSet<FactId> = plain.lookup(&pattern).into_iter().map(|(id, _)| id).collect();
        prop_assert_eq!(a, b);
    }
}
