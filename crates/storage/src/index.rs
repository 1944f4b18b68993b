//! Secondary field indexes.
//!
//! A `FieldIndex` maps the values of a sorted field set to the ids of the
//! facts carrying them. Facts missing any indexed field are not indexed.

use cairn_core::{Fact, FactId, Value};
use hashbrown::HashMap;

/// A hash index over a composite field key.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    /// Indexed fields, sorted and deduplicated.
    fields: Vec<String>,
    /// The underlying map from composite keys to fact ids.
    map: HashMap<Vec<Value>, Vec<FactId>>,
    /// Number of indexed entries.
    len: usize,
}

impl FieldIndex {
    /// Creates an empty index over `fields`.
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: normalize_fields(fields),
            map: HashMap::new(),
            len: 0,
        }
    }

    /// Returns the indexed fields in sorted order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Extracts the composite key of a fact, or None if a field is missing.
    pub fn key_of(&self, fact: &Fact) -> Option<Vec<Value>> {
        self.fields
            .iter()
            .map(|f| fact.get(f).cloned())
            .collect()
    }

    /// Indexes a fact under its id.
    pub fn insert(&mut self, id: FactId, fact: &Fact) {
        if let Some(key) = self.key_of(fact) {
            self.map.entry(key).or_default().push(id);
            self.len += 1;
        }
    }

    /// Removes a fact from the index.
    pub fn remove(&mut self, id: FactId, fact: &Fact) {
        let Some(key) = self.key_of(fact) else {
            return;
        };
        if let Some(ids) = self.map.get_mut(&key) {
            let original_len = ids.len();
            ids.retain(|&x| x != id);
            self.len -= original_len - ids.len();
            if ids.is_empty() {
                self.map.remove(&key);
            }
        }
    }

    /// Returns the ids stored under `key` (values in field order).
    pub fn get(&self, key: &[Value]) -> &[FactId] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.map.len()
    }

    /// Number of indexed facts.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clears all entries.
    pub fn clear(&mut self) {
        self.map.clear();
        self.len = 0;
    }
}

/// Sorts and deduplicates a field list into canonical index order.
pub fn normalize_fields<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Vec<String> {
    let mut fields: Vec<String> = fields.into_iter().map(Into::into).collect();
    fields.sort();
    fields.dedup();
    fields
}
