//! Changesets: batched, mergeable descriptions of base table changes.
//!
//! A `Changeset` has no effect until it is applied. Tables keep the order in
//! which they were first touched.

use cairn_core::Fact;

/// Requested changes for one table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableDiff {
    /// Facts to add.
    pub adds: Vec<Fact>,
    /// Concrete facts to remove.
    pub removes: Vec<Fact>,
    /// Patterns; every fact matching one is removed when applied.
    pub remove_patterns: Vec<Fact>,
}

impl TableDiff {
    /// Returns true if the diff requests nothing.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removes.is_empty() && self.remove_patterns.is_empty()
    }

    fn extend(&mut self, other: TableDiff) {
        self.adds.extend(other.adds);
        self.removes.extend(other.removes);
        self.remove_patterns.extend(other.remove_patterns);
    }
}

/// Ordered per-table adds and removes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Changeset {
    tables: Vec<(String, TableDiff)>,
}

impl Changeset {
    /// Creates an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    fn diff_mut(&mut self, table: &str) -> &mut TableDiff {
        let pos = match self.tables.iter().position(|(name, _)| name == table) {
            Some(pos) => pos,
            None => {
                self.tables.push((table.to_string(), TableDiff::default()));
                self.tables.len() - 1
            }
        };
        &mut self.tables[pos].1
    }

    /// Adds a fact to `table`.
    pub fn add(&mut self, table: &str, fact: Fact) -> &mut Self {
        self.diff_mut(table).adds.push(fact);
        self
    }

    /// Adds many facts to `table`.
    pub fn add_many(&mut self, table: &str, facts: impl IntoIterator<Item = Fact>) -> &mut Self {
        self.diff_mut(table).adds.extend(facts);
        self
    }

    /// Removes every fact of `table` matching `pattern` at apply time.
    ///
    /// The empty pattern removes the whole table.
    pub fn remove(&mut self, table: &str, pattern: Fact) -> &mut Self {
        self.diff_mut(table).remove_patterns.push(pattern);
        self
    }

    /// Removes concrete facts from `table`.
    pub fn remove_facts(&mut self, table: &str, facts: impl IntoIterator<Item = Fact>) -> &mut Self {
        self.diff_mut(table).removes.extend(facts);
        self
    }

    /// Appends every request of `other`, preserving table order.
    pub fn merge(&mut self, other: Changeset) -> &mut Self {
        for (table, diff) in other.tables {
            self.diff_mut(&table).extend(diff);
        }
        self
    }

    /// Returns the inverse changeset.
    ///
    /// Concrete adds and removes are swapped. Pattern removals have no inverse
    /// and are dropped.
    pub fn reverse(&self) -> Changeset {
        let tables = self
            .tables
            .iter()
            .map(|(name, diff)| {
                (
                    name.clone(),
                    TableDiff {
                        adds: diff.removes.clone(),
                        removes: diff.adds.clone(),
                        remove_patterns: Vec::new(),
                    },
                )
            })
            .filter(|(_, diff)| !diff.is_empty())
            .collect();
        Changeset { tables }
    }

    /// Returns the diff requested for `table`.
    pub fn get(&self, table: &str) -> Option<&TableDiff> {
        self.tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, diff)| diff)
    }

    /// Iterates tables in first-touched order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableDiff)> {
        self.tables.iter().map(|(name, diff)| (name.as_str(), diff))
    }

    /// Names of the touched tables.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|(name, _)| name.as_str())
    }

    /// Returns true if nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|(_, diff)| diff.is_empty())
    }

    /// Total number of requested adds and removes, patterns included.
    pub fn len(&self) -> usize {
        self.tables
            .iter()
            .map(|(_, d)| d.adds.len() + d.removes.len() + d.remove_patterns.len())
            .sum()
    }
}

impl IntoIterator for Changeset {
    type Item = (String, TableDiff);
    type IntoIter = std::vec::IntoIter<(String, TableDiff)>;

    fn into_iter(self) -> Self::IntoIter {
        self.tables.into_iter()
    }
}
