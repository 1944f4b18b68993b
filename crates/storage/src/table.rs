//! Fact storage for a single table.
//!
//! This module provides the `Table` struct which holds the facts of one base or
//! derived table, keeps its secondary indexes in sync and records which views
//! read it.

use crate::delta::TableDelta;
use crate::index::{normalize_fields, FieldIndex};
use cairn_core::{Fact, FactId};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

/// Whether a table is written by changesets or maintained by a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Written directly by changesets.
    Base,
    /// Content owned by the view of the same name.
    Derived,
}

/// How facts of a table are identified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Keys {
    /// Identity is the values of these fields (sorted).
    Fields(Vec<String>),
    /// Identity is the whole fact.
    Content,
}

impl Keys {
    /// Builds keys from a field list. An empty list means content identity.
    pub fn from_fields<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        let fields = normalize_fields(fields);
        if fields.is_empty() {
            Keys::Content
        } else {
            Keys::Fields(fields)
        }
    }

    /// Computes the id of a fact under these keys.
    pub fn id_of(&self, fact: &Fact) -> FactId {
        match self {
            Keys::Fields(fields) => FactId::for_fields(fact, fields),
            Keys::Content => FactId::of_content(fact),
        }
    }

    /// Returns the key fields, or None for content identity.
    pub fn fields(&self) -> Option<&[String]> {
        match self {
            Keys::Fields(fields) => Some(fields),
            Keys::Content => None,
        }
    }
}

/// Facts, indexes and trigger registrations of one table.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    kind: TableKind,
    keys: Keys,
    content: BTreeMap<FactId, Rc<Fact>>,
    indexes: BTreeMap<Vec<String>, FieldIndex>,
    dependents: BTreeSet<String>,
}

impl Table {
    /// Creates an empty table.
    pub fn new(name: impl Into<String>, kind: TableKind, keys: Keys) -> Self {
        Self {
            name: name.into(),
            kind,
            keys,
            content: BTreeMap::new(),
            indexes: BTreeMap::new(),
            dependents: BTreeSet::new(),
        }
    }

    /// Returns the table name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the table kind.
    #[inline]
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Returns true for tables maintained by a view.
    #[inline]
    pub fn is_derived(&self) -> bool {
        self.kind == TableKind::Derived
    }

    /// Returns the identity keys.
    #[inline]
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Number of facts.
    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Returns true if the table holds no facts.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Returns the fact stored under `id`.
    pub fn get(&self, id: &FactId) -> Option<&Rc<Fact>> {
        self.content.get(id)
    }

    /// Returns true if a fact with this id is present.
    pub fn contains(&self, id: &FactId) -> bool {
        self.content.contains_key(id)
    }

    /// Iterates facts in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&FactId, &Rc<Fact>)> {
        self.content.iter()
    }

    /// Returns the id a fact would have in this table.
    pub fn id_of(&self, fact: &Fact) -> FactId {
        self.keys.id_of(fact)
    }

    /// Inserts a fact under `id` unless the id is taken. Returns true if inserted.
    pub fn insert(&mut self, id: FactId, fact: Rc<Fact>) -> bool {
        if self.content.contains_key(&id) {
            return false;
        }
        for index in self.indexes.values_mut() {
            index.insert(id, &fact);
        }
        self.content.insert(id, fact);
        true
    }

    /// Removes the fact stored under `id`.
    pub fn remove(&mut self, id: &FactId) -> Option<Rc<Fact>> {
        let fact = self.content.remove(id)?;
        for index in self.indexes.values_mut() {
            index.remove(*id, &fact);
        }
        Some(fact)
    }

    /// Applies adds and removes with set semantics and returns the real delta.
    ///
    /// Requests are netted per id: more adds than removes adds the fact if
    /// absent, more removes than adds removes the stored fact if present. A
    /// balanced remove and add of a stored key with new content replaces it.
    pub fn apply(
        &mut self,
        adds: impl IntoIterator<Item = Fact>,
        removes: impl IntoIterator<Item = Fact>,
    ) -> TableDelta {
        let mut order: Vec<FactId> = Vec::new();
        let mut pending: HashMap<FactId, (i64, Option<Fact>)> = HashMap::new();

        for fact in adds {
            let id = self.keys.id_of(&fact);
            let slot = pending.entry(id).or_insert_with(|| {
                order.push(id);
                (0, None)
            });
            slot.0 += 1;
            if slot.1.is_none() {
                slot.1 = Some(fact);
            }
        }
        for fact in removes {
            let id = self.keys.id_of(&fact);
            let slot = pending.entry(id).or_insert_with(|| {
                order.push(id);
                (0, None)
            });
            slot.0 -= 1;
        }

        let mut delta = TableDelta::new();
        for id in order {
            let Some((count, fact)) = pending.remove(&id) else {
                continue;
            };
            if count > 0 && !self.content.contains_key(&id) {
                if let Some(fact) = fact {
                    let fact = Rc::new(fact);
                    self.insert(id, Rc::clone(&fact));
                    delta.adds.push((id, fact));
                }
            } else if count < 0 {
                if let Some(old) = self.remove(&id) {
                    delta.removes.push((id, old));
                }
            } else if count == 0 {
                // remove + add of the same key with new content replaces it
                let Some(fact) = fact else { continue };
                if self.content.get(&id).is_some_and(|old| **old != fact) {
                    if let Some(old) = self.remove(&id) {
                        delta.removes.push((id, old));
                    }
                    let fact = Rc::new(fact);
                    self.insert(id, Rc::clone(&fact));
                    delta.adds.push((id, fact));
                }
            }
        }
        delta
    }

    /// Replaces the whole content and returns the real delta.
    pub fn replace_content(&mut self, next: BTreeMap<FactId, Rc<Fact>>) -> TableDelta {
        let mut delta = TableDelta::new();
        let stale: Vec<FactId> = self
            .content
            .keys()
            .filter(|id| !next.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            if let Some(old) = self.remove(&id) {
                delta.removes.push((id, old));
            }
        }
        for (id, fact) in next {
            if self.insert(id, Rc::clone(&fact)) {
                delta.adds.push((id, fact));
            }
        }
        delta
    }

    /// Removes every fact and returns them as a delta.
    pub fn clear(&mut self) -> TableDelta {
        let next = BTreeMap::new();
        self.replace_content(next)
    }

    /// Changes the identity keys and re-keys the content.
    ///
    /// Facts that collide under the new keys keep the first in old id order.
    /// Every fact whose id changed is reported as removed under its old id and,
    /// if kept, added under its new one.
    pub fn set_keys(&mut self, keys: Keys) -> TableDelta {
        let mut delta = TableDelta::new();
        if keys == self.keys {
            return delta;
        }
        self.keys = keys;
        let old = std::mem::take(&mut self.content);
        for index in self.indexes.values_mut() {
            index.clear();
        }
        for (old_id, fact) in old {
            let id = self.keys.id_of(&fact);
            let kept = self.insert(id, Rc::clone(&fact));
            if kept && id == old_id {
                continue;
            }
            delta.removes.push((old_id, Rc::clone(&fact)));
            if kept {
                delta.adds.push((id, fact));
            }
        }
        delta
    }

    /// Returns the index over exactly `fields`, creating and back-filling it if needed.
    pub fn ensure_index<S: Into<String>>(&mut self, fields: impl IntoIterator<Item = S>) -> &FieldIndex {
        let fields = normalize_fields(fields);
        let content = &self.content;
        self.indexes.entry(fields.clone()).or_insert_with(|| {
            let mut index = FieldIndex::new(fields);
            for (id, fact) in content {
                index.insert(*id, fact);
            }
            index
        })
    }

    /// Returns the index over exactly `fields` if it exists.
    pub fn index(&self, fields: &[String]) -> Option<&FieldIndex> {
        let fields = normalize_fields(fields.iter().cloned());
        self.indexes.get(&fields)
    }

    /// Number of secondary indexes.
    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    /// Returns every fact matching `pattern`.
    ///
    /// Uses the key fields or the widest index covered by the pattern when one
    /// applies; otherwise scans.
    pub fn lookup(&self, pattern: &Fact) -> Vec<(FactId, Rc<Fact>)> {
        if pattern.is_empty() {
            return self
                .content
                .iter()
                .map(|(id, f)| (*id, Rc::clone(f)))
                .collect();
        }

        if let Keys::Fields(keys) = &self.keys {
            if keys.iter().all(|k| pattern.contains(k)) {
                let id = FactId::for_fields(pattern, keys);
                return self
                    .content
                    .get(&id)
                    .filter(|f| f.matches(pattern))
                    .map(|f| vec![(id, Rc::clone(f))])
                    .unwrap_or_default();
            }
        }

        let best = self
            .indexes
            .values()
            .filter(|index| index.fields().iter().all(|f| pattern.contains(f)))
            .max_by_key(|index| index.fields().len());

        match best.and_then(|index| index.key_of(pattern).map(|key| (index, key))) {
            Some((index, key)) => index
                .get(&key)
                .iter()
                .filter_map(|id| self.content.get(id).map(|f| (*id, f)))
                .filter(|(_, f)| f.matches(pattern))
                .map(|(id, f)| (id, Rc::clone(f)))
                .collect(),
            None => self
                .content
                .iter()
                .filter(|(_, f)| f.matches(pattern))
                .map(|(id, f)| (*id, Rc::clone(f)))
                .collect(),
        }
    }

    /// Registers a view as reading this table.
    pub fn add_dependent(&mut self, view: impl Into<String>) {
        self.dependents.insert(view.into());
    }

    /// Unregisters a view.
    pub fn remove_dependent(&mut self, view: &str) -> bool {
        self.dependents.remove(view)
    }

    /// Views reading this table.
    pub fn dependents(&self) -> &BTreeSet<String> {
        &self.dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::{fact, Value};

    fn people() -> Table {
        Table::new("people", TableKind::Base, Keys::from_fields(["name"]))
    }

    #[test]
    fn test_empty_key_list_is_content() {
        assert_eq!(Keys::from_fields(Vec::<String>::new()), Keys::Content);
    }

    #[test]
    fn test_apply_set_semantics() {
        let mut t = people();
        let d = t.apply(vec![fact! { "name" => "Amy" }, fact! { "name" => "Amy" }], vec![]);
        assert_eq!(d.added(), 1);
        assert_eq!(t.len(), 1);

        let d = t.apply(vec![fact! { "name" => "Amy" }], vec![]);
        assert!(d.is_empty());
    }

    #[test]
    fn test_apply_add_remove_same_id_cancels() {
        let mut t = people();
        let d = t.apply(vec![fact! { "name" => "Amy" }], vec![fact! { "name" => "Amy" }]);
        assert!(d.is_empty());
        assert!(t.is_empty());
    }

    #[test]
    fn test_remove_by_key_drops_stored_fact() {
        let mut t = people();
        t.apply(vec![fact! { "name" => "Amy", "age" => 30 }], vec![]);
        let d = t.apply(vec![], vec![fact! { "name" => "Amy" }]);
        assert_eq!(d.removed(), 1);
        assert_eq!(d.removes[0].1.get("age"), Some(&Value::Int64(30)));
        assert!(t.is_empty());
    }

    #[test]
    fn test_balanced_remove_add_replaces_content() {
        let mut t = people();
        t.apply(vec![fact! { "name" => "Bo", "age" => 17 }], vec![]);
        let d = t.apply(
            vec![fact! { "name" => "Bo", "age" => 25 }],
            vec![fact! { "name" => "Bo", "age" => 17 }],
        );
        assert_eq!((d.added(), d.removed()), (1, 1));
        assert_eq!(t.lookup(&fact! { "name" => "Bo" })[0].1.get("age"), Some(&Value::Int64(25)));

        let d = t.apply(
            vec![fact! { "name" => "Bo", "age" => 25 }],
            vec![fact! { "name" => "Bo", "age" => 25 }],
        );
        assert!(d.is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut t = people();
        let d = t.apply(vec![], vec![fact! { "name" => "Nobody" }]);
        assert!(d.is_empty());
    }

    #[test]
    fn test_index_backfill_and_maintenance() {
        let mut t = Table::new("p", TableKind::Base, Keys::Content);
        t.apply(vec![fact! { "city" => "Oslo", "n" => 1 }], vec![]);
        assert_eq!(t.ensure_index(["city"]).len(), 1);

        t.apply(vec![fact! { "city" => "Oslo", "n" => 2 }], vec![]);
        let key = [Value::from("Oslo")];
        assert_eq!(t.index(&["city".to_string()]).map(|i| i.get(&key).len()), Some(2));

        t.apply(vec![], vec![fact! { "city" => "Oslo", "n" => 1 }]);
        assert_eq!(t.index(&["city".to_string()]).map(|i| i.get(&key).len()), Some(1));
    }

    #[test]
    fn test_lookup_paths_agree() {
        let mut t = Table::new("p", TableKind::Base, Keys::Content);
        let facts: Vec<Fact> = (0..10)
            .map(|i| fact! { "g" => i % 3, "n" => i })
            .collect();
        t.apply(facts, vec![]);

        let pattern = fact! { "g" => 1 };
        let mut scanned: Vec<FactId> = t.lookup(&pattern).into_iter().map(|(id, _)| id).collect();
        t.ensure_index(["g"]);
        let mut indexed: Vec<FactId> = t.lookup(&pattern).into_iter().map(|(id, _)| id).collect();
        scanned.sort();
        indexed.sort();
        assert_eq!(scanned.len(), 3);
        assert_eq!(scanned, indexed);
    }

    #[test]
    fn test_lookup_by_key() {
        let mut t = people();
        t.apply(vec![fact! { "name" => "Amy", "age" => 30 }], vec![]);
        assert_eq!(t.lookup(&fact! { "name" => "Amy" }).len(), 1);
        assert!(t.lookup(&fact! { "name" => "Amy", "age" => 31 }).is_empty());
    }

    #[test]
    fn test_replace_content_reports_delta() {
        let mut t = Table::new("v", TableKind::Derived, Keys::Content);
        let a = Rc::new(fact! { "n" => 1 });
        let b = Rc::new(fact! { "n" => 2 });
        let mut next = BTreeMap::new();
        next.insert(FactId::of_content(&a), Rc::clone(&a));
        let d = t.replace_content(next);
        assert_eq!(d.added(), 1);

        let mut next = BTreeMap::new();
        next.insert(FactId::of_content(&b), Rc::clone(&b));
        let d = t.replace_content(next);
        assert_eq!(d.added(), 1);
        assert_eq!(d.removed(), 1);
    }

    #[test]
    fn test_set_keys_rekeys_and_drops_collisions() {
        let mut t = Table::new("p", TableKind::Base, Keys::Content);
        t.apply(
            vec![
                fact! { "name" => "Amy", "age" => 30 },
                fact! { "name" => "Amy", "age" => 31 },
            ],
            vec![],
        );
        let d = t.set_keys(Keys::from_fields(["name"]));
        assert_eq!(d.removed(), 2);
        assert_eq!(d.added(), 1);
        assert_eq!(t.len(), 1);
        assert_eq!(t.lookup(&fact! { "name" => "Amy" }).len(), 1);
    }

    #[test]
    fn test_dependents() {
        let mut t = people();
        t.add_dependent("adults");
        assert!(t.dependents().contains("adults"));
        assert!(t.remove_dependent("adults"));
        assert!(t.dependents().is_empty());
    }
}
