//! Bulk export and import of base tables.
//!
//! A snapshot maps each base table to its facts. Derived tables are not
//! exported; they are rebuilt by their views when the snapshot is imported.

use crate::indexer::Indexer;
use crate::report::ApplyReport;
use cairn_core::{Fact, Result};
use cairn_storage::Changeset;
use std::collections::BTreeMap;
use tracing::debug;

/// Base table name -> facts.
pub type Snapshot = BTreeMap<String, Vec<Fact>>;

impl Indexer {
    /// Copies the content of every base table.
    pub fn export(&self) -> Snapshot {
        self.store()
            .tables()
            .filter(|t| !t.is_derived())
            .map(|t| {
                let facts = t.iter().map(|(_, f)| (**f).clone()).collect();
                (t.name().to_string(), facts)
            })
            .collect()
    }

    /// Exports as a JSON object of arrays of flat objects.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.export())?)
    }

    /// Adds every fact of `snapshot` in one changeset.
    pub fn import(&mut self, snapshot: Snapshot) -> Result<ApplyReport> {
        let mut changes = Changeset::new();
        for (table, facts) in snapshot {
            debug!(table = %table, facts = facts.len(), "importing table");
            changes.add_many(&table, facts);
        }
        self.apply_diff(changes)
    }

    /// Parses a JSON snapshot and imports it.
    pub fn import_json(&mut self, json: &str) -> Result<ApplyReport> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        self.import(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{fact, Error, Value};
    use cairn_query::{MemberField, Union};

    fn populated() -> Indexer {
        let mut indexer = Indexer::new();
        indexer.add_table("people", &["name"]).unwrap();
        let mut changes = Changeset::new();
        changes
            .add("people", fact! { "name" => "Amy", "age" => 30, "score" => 1.5 })
            .add("people", fact! { "name" => "Bo", "age" => Value::Null });
        indexer.apply_diff(changes).unwrap();
        indexer
            .register_union("names", Union::new().union("people", vec![("who", MemberField::source("name"))]))
            .unwrap();
        indexer
    }

    #[test]
    fn test_export_skips_derived_tables() {
        let snapshot = populated().export();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["people"]);
        assert_eq!(snapshot["people"].len(), 2);
    }

    #[test]
    fn test_json_round_trip_preserves_types() {
        let json = populated().export_json().unwrap();
        assert!(json.contains("\"score\":1.5"));

        let mut restored = Indexer::new();
        restored.add_table("people", &["name"]).unwrap();
        restored.import_json(&json).unwrap();
        let amy = restored.find_one("people", &fact! { "name" => "Amy" }).unwrap();
        assert_eq!(amy.get("age"), Some(&Value::Int64(30)));
        assert_eq!(amy.get("score"), Some(&Value::Float64(1.5)));
        let bo = restored.find_one("people", &fact! { "name" => "Bo" }).unwrap();
        assert_eq!(bo.get("age"), Some(&Value::Null));
    }

    #[test]
    fn test_import_feeds_views() {
        let snapshot = populated().export();
        let mut restored = Indexer::new();
        restored.add_table("people", &["name"]).unwrap();
        restored
            .register_union("names", Union::new().union("people", vec![("who", MemberField::source("name"))]))
            .unwrap();
        let report = restored.import(snapshot).unwrap();
        assert_eq!(report.view("names").map(|d| d.added), Some(2));
    }

    #[test]
    fn test_bad_json_is_serialization_error() {
        let err = Indexer::new().import_json("[1, 2").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
