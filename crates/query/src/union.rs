//! Unions of field-mapped source tables.
//!
//! Every member maps the rows of one table onto a shared output field set.
//! Rows with equal content coalesce into one derived fact that keeps one
//! instance per member row.

use crate::plan::ViewPlan;
use cairn_core::{CompileError, Fact, Result, Value};
use cairn_storage::{DerivedDelta, DerivedRow, InputChanges, InstanceId, SourceRef, Store};
use std::collections::BTreeSet;
use tracing::trace;

/// Where a member's output field comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum MemberField {
    /// A field of the member's source row.
    Source(String),
    /// A constant.
    Literal(Value),
}

impl MemberField {
    /// Reads `field` from the source row.
    pub fn source(field: impl Into<String>) -> Self {
        MemberField::Source(field.into())
    }

    /// A constant value.
    pub fn literal(value: impl Into<Value>) -> Self {
        MemberField::Literal(value.into())
    }
}

/// One source table of a union.
#[derive(Clone, Debug, PartialEq)]
pub struct UnionMember {
    /// Table the member reads.
    pub table: String,
    /// Output field -> origin.
    pub fields: Vec<(String, MemberField)>,
}

/// A deduplicating merge of source tables.
///
/// ```rust
/// use cairn_query::{MemberField, Union};
///
/// let staff = Union::new()
///     .union("employees", vec![("name", MemberField::source("name"))])
///     .union("contractors", vec![("name", MemberField::source("full_name"))]);
/// assert_eq!(staff.members().len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Union {
    members: Vec<UnionMember>,
}

impl Union {
    /// Creates a union with no members.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member reading `table`.
    pub fn union(mut self, table: &str, fields: Vec<(&str, MemberField)>) -> Self {
        self.members.push(UnionMember {
            table: table.to_string(),
            fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        });
        self
    }

    /// Members in declaration order.
    pub fn members(&self) -> &[UnionMember] {
        &self.members
    }

    /// Checks the members against `store` and builds a plan.
    pub fn compile(&self, store: &Store) -> std::result::Result<UnionPlan, CompileError> {
        let first = self.members.first().ok_or(CompileError::EmptyUnion)?;
        let expected: BTreeSet<&str> = first.fields.iter().map(|(k, _)| k.as_str()).collect();

        let mut reads: Vec<String> = Vec::new();
        for (ix, member) in self.members.iter().enumerate() {
            if !store.has_table(&member.table) {
                return Err(CompileError::UnknownTable {
                    table: member.table.clone(),
                });
            }
            let names: BTreeSet<&str> = member.fields.iter().map(|(k, _)| k.as_str()).collect();
            if names != expected || names.len() != member.fields.len() {
                return Err(CompileError::MismatchedMemberFields {
                    member: ix,
                    table: member.table.clone(),
                });
            }
            if !reads.contains(&member.table) {
                reads.push(member.table.clone());
            }
        }

        Ok(UnionPlan {
            members: self.members.clone(),
            reads,
        })
    }
}

/// A compiled union.
#[derive(Clone, Debug)]
pub struct UnionPlan {
    members: Vec<UnionMember>,
    reads: Vec<String>,
}

impl UnionPlan {
    fn map(&self, member: usize, table: &str, id: cairn_core::FactId, row: &Fact) -> Option<DerivedRow> {
        let mut fact = Fact::new();
        for (name, origin) in &self.members[member].fields {
            let value = match origin {
                MemberField::Source(field) => row.get(field)?.clone(),
                MemberField::Literal(value) => value.clone(),
            };
            fact.insert(name.as_str(), value);
        }
        let sources = vec![SourceRef::new(table, id)];
        Some(DerivedRow {
            fact,
            instance: InstanceId::from_sources(member as u64, &sources),
            sources,
        })
    }
}

impl ViewPlan for UnionPlan {
    fn reads(&self) -> &[String] {
        &self.reads
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    fn execute_full(&self, store: &Store) -> Result<Vec<DerivedRow>> {
        let mut out = Vec::new();
        for (ix, member) in self.members.iter().enumerate() {
            let Some(table) = store.table(&member.table) else {
                continue;
            };
            out.extend(
                table
                    .iter()
                    .filter_map(|(id, fact)| self.map(ix, &member.table, *id, fact)),
            );
        }
        trace!(rows = out.len(), "full union execution");
        Ok(out)
    }

    fn execute_incremental(&self, _store: &Store, changes: &InputChanges) -> Result<DerivedDelta> {
        let mut delta = DerivedDelta::default();
        for (ix, member) in self.members.iter().enumerate() {
            let Some(change) = changes.get(&member.table) else {
                continue;
            };
            // a removed source is gone from its table, so its instances go too;
            // other members keep supporting the same content
            for (id, _) in &change.removes {
                let source = SourceRef::new(member.table.as_str(), *id);
                if !delta.retracted.contains(&source) {
                    delta.retracted.push(source);
                }
            }
            delta.adds.extend(
                change
                    .adds
                    .iter()
                    .filter_map(|(id, fact)| self.map(ix, &member.table, *id, fact)),
            );
        }
        trace!(
            added = delta.adds.len(),
            retracted = delta.retracted.len(),
            "incremental union execution"
        );
        Ok(delta)
    }
}
