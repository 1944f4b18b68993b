//! Provenance ledger for derived facts.
//!
//! Every derived fact is backed by one or more row-instances; each instance
//! names the source facts it was produced from. A derived fact lives while at
//! least one instance survives. Retracting a source drops every instance that
//! used it.

use cairn_core::FactId;
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A fact in a named table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceRef {
    /// Table holding the fact.
    pub table: String,
    /// Id of the fact in that table.
    pub id: FactId,
}

impl SourceRef {
    /// Creates a source reference.
    pub fn new(table: impl Into<String>, id: FactId) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

/// Identity of one row-instance, derived from its ordered sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u128);

impl InstanceId {
    /// Digest of `sources` in order, salted with `salt`.
    ///
    /// Unions salt with the member position so the same source row mapped by
    /// two members yields two instances.
    pub fn from_sources(salt: u64, sources: &[SourceRef]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&salt.to_le_bytes());
        for source in sources {
            hasher.update(&(source.table.len() as u64).to_le_bytes());
            hasher.update(source.table.as_bytes());
            hasher.update(&source.id.as_u128().to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Self(u128::from_le_bytes(bytes))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// One provenance edge: a derived fact's instance drew on a source fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvenanceEdge {
    /// Derived table.
    pub table: String,
    /// Derived fact id.
    pub id: FactId,
    /// Row-instance within the derived fact.
    pub instance: InstanceId,
    /// Source fact.
    pub source: SourceRef,
}

type Instances = BTreeMap<InstanceId, Vec<SourceRef>>;

/// Derived table -> derived id -> instance -> sources, with a reverse map.
#[derive(Debug, Default, Clone)]
pub struct ProvenanceLedger {
    derived: HashMap<String, BTreeMap<FactId, Instances>>,
    by_source: HashMap<SourceRef, BTreeSet<(String, FactId, InstanceId)>>,
    edges: usize,
}

impl ProvenanceLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an instance of `table`/`id`. Returns false if it was already known.
    pub fn record(&mut self, table: &str, id: FactId, instance: InstanceId, sources: Vec<SourceRef>) -> bool {
        let facts = self.derived.entry_ref(table).or_default();
        let instances = facts.entry(id).or_default();
        if instances.contains_key(&instance) {
            return false;
        }
        for source in &sources {
            self.by_source
                .entry(source.clone())
                .or_default()
                .insert((table.to_string(), id, instance));
        }
        self.edges += sources.len();
        instances.insert(instance, sources);
        true
    }

    /// Drops every instance of `table` that used `source`.
    ///
    /// Returns the affected derived ids that have no instance left.
    pub fn retract_source(&mut self, table: &str, source: &SourceRef) -> Vec<FactId> {
        let Some(users) = self.by_source.get(source) else {
            return Vec::new();
        };
        let hits: Vec<(FactId, InstanceId)> = users
            .iter()
            .filter(|(t, _, _)| t == table)
            .map(|(_, id, instance)| (*id, *instance))
            .collect();

        let mut orphaned = Vec::new();
        for (id, instance) in hits {
            self.drop_instance(table, id, instance);
            if self.instance_count(table, &id) == 0 && !orphaned.contains(&id) {
                orphaned.push(id);
            }
        }
        orphaned
    }

    fn drop_instance(&mut self, table: &str, id: FactId, instance: InstanceId) {
        let Some(facts) = self.derived.get_mut(table) else {
            return;
        };
        let Some(instances) = facts.get_mut(&id) else {
            return;
        };
        let Some(sources) = instances.remove(&instance) else {
            return;
        };
        if instances.is_empty() {
            facts.remove(&id);
        }
        self.edges -= sources.len();
        for source in sources {
            if let Some(users) = self.by_source.get_mut(&source) {
                users.remove(&(table.to_string(), id, instance));
                if users.is_empty() {
                    self.by_source.remove(&source);
                }
            }
        }
    }

    /// Drops all provenance of one derived fact.
    pub fn clear_fact(&mut self, table: &str, id: &FactId) {
        let instances: Vec<InstanceId> = self
            .derived
            .get(table)
            .and_then(|facts| facts.get(id))
            .map(|instances| instances.keys().copied().collect())
            .unwrap_or_default();
        for instance in instances {
            self.drop_instance(table, *id, instance);
        }
    }

    /// Drops all provenance of a derived table.
    pub fn clear_table(&mut self, table: &str) {
        let Some(facts) = self.derived.remove(table) else {
            return;
        };
        for (id, instances) in facts {
            for (instance, sources) in instances {
                self.edges -= sources.len();
                for source in sources {
                    if let Some(users) = self.by_source.get_mut(&source) {
                        users.remove(&(table.to_string(), id, instance));
                        if users.is_empty() {
                            self.by_source.remove(&source);
                        }
                    }
                }
            }
        }
    }

    /// Number of surviving instances of a derived fact.
    pub fn instance_count(&self, table: &str, id: &FactId) -> usize {
        self.derived
            .get(table)
            .and_then(|facts| facts.get(id))
            .map_or(0, BTreeMap::len)
    }

    /// Source lists of every instance of a derived fact.
    pub fn instances(&self, table: &str, id: &FactId) -> impl Iterator<Item = &[SourceRef]> {
        self.derived
            .get(table)
            .and_then(|facts| facts.get(id))
            .into_iter()
            .flat_map(|instances| instances.values().map(Vec::as_slice))
    }

    /// Edges whose source is `source`, across all derived tables.
    pub fn edges_from(&self, source: &SourceRef) -> Vec<ProvenanceEdge> {
        self.by_source
            .get(source)
            .into_iter()
            .flatten()
            .map(|(table, id, instance)| ProvenanceEdge {
                table: table.clone(),
                id: *id,
                instance: *instance,
                source: source.clone(),
            })
            .collect()
    }

    /// Edges into one derived fact.
    pub fn edges_into(&self, table: &str, id: &FactId) -> Vec<ProvenanceEdge> {
        let Some(instances) = self.derived.get(table).and_then(|facts| facts.get(id)) else {
            return Vec::new();
        };
        instances
            .iter()
            .flat_map(|(instance, sources)| {
                sources.iter().map(move |source| ProvenanceEdge {
                    table: table.to_string(),
                    id: *id,
                    instance: *instance,
                    source: source.clone(),
                })
            })
            .collect()
    }

    /// Total number of edges.
    pub fn len(&self) -> usize {
        self.edges
    }

    /// Returns true if no edge is recorded.
    pub fn is_empty(&self) -> bool {
        self.edges == 0
    }
}
