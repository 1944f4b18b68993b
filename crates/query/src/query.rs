//! Query definitions.
//!
//! A `Query` is a declarative pipeline of stages built with consuming builder
//! methods. It is compiled into a [`QueryPlan`](crate::QueryPlan) against a
//! store and a function registry.

use crate::binding::{Binding, FieldRef, Limit, SortField};
use crate::compile::{compile_query, QueryPlan};
use crate::functions::FunctionRegistry;
use cairn_core::CompileError;
use cairn_storage::Store;

/// One stage of a query pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
    /// Join (or, negated, anti-join) against a table.
    Select {
        /// Table read by the stage.
        table: String,
        /// Field of this table -> value it must equal.
        bindings: Vec<(String, Binding)>,
        /// True for `deselect`.
        negated: bool,
    },
    /// Per-row filter or calculation.
    Calculate {
        /// Function name.
        function: String,
        /// Parameter name -> argument.
        args: Vec<(String, Binding)>,
    },
    /// Aggregate folded over each group.
    Aggregate {
        /// Function name.
        function: String,
        /// Parameter name -> argument.
        args: Vec<(String, Binding)>,
    },
}

/// A stage together with its optional alias.
#[derive(Clone, Debug, PartialEq)]
pub struct StageSpec {
    /// The stage.
    pub stage: Stage,
    /// Name other stages use to refer to it.
    pub alias: Option<String>,
}

/// A declarative join/filter/aggregate/project pipeline.
///
/// ```rust
/// use cairn_query::{Binding, Query};
///
/// let adults = Query::new()
///     .select("people", vec![], Some("p"))
///     .calculate(">", vec![("a", Binding::field("p", "age")), ("b", Binding::value(21))], None)
///     .project(vec![("name", Binding::field("p", "name"))]);
/// assert_eq!(adults.stages().len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    stages: Vec<StageSpec>,
    sort: Vec<SortField>,
    group: Vec<FieldRef>,
    limit: Option<Limit>,
    projection: Option<Vec<(String, Binding)>>,
    incremental_required: bool,
}

fn owned(map: Vec<(&str, Binding)>) -> Vec<(String, Binding)> {
    map.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

impl Query {
    /// Creates an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, stage: Stage, alias: Option<&str>) -> Self {
        self.stages.push(StageSpec {
            stage,
            alias: alias.map(str::to_string),
        });
        self
    }

    /// Joins rows of `table` whose fields equal the bound values.
    pub fn select(self, table: &str, join: Vec<(&str, Binding)>, alias: Option<&str>) -> Self {
        self.push(
            Stage::Select {
                table: table.to_string(),
                bindings: owned(join),
                negated: false,
            },
            alias,
        )
    }

    /// Keeps only candidates for which no row of `table` matches.
    pub fn deselect(self, table: &str, join: Vec<(&str, Binding)>, alias: Option<&str>) -> Self {
        self.push(
            Stage::Select {
                table: table.to_string(),
                bindings: owned(join),
                negated: true,
            },
            alias,
        )
    }

    /// Applies a filter or calculation function to every candidate.
    pub fn calculate(self, function: &str, args: Vec<(&str, Binding)>, alias: Option<&str>) -> Self {
        self.push(
            Stage::Calculate {
                function: function.to_string(),
                args: owned(args),
            },
            alias,
        )
    }

    /// Folds an aggregate function over each group.
    pub fn aggregate(self, function: &str, args: Vec<(&str, Binding)>, alias: Option<&str>) -> Self {
        self.push(
            Stage::Aggregate {
                function: function.to_string(),
                args: owned(args),
            },
            alias,
        )
    }

    /// Sets the sort keys.
    pub fn sort(mut self, fields: Vec<SortField>) -> Self {
        self.sort = fields;
        self
    }

    /// Sets the grouping keys.
    pub fn group(mut self, fields: Vec<FieldRef>) -> Self {
        self.group = fields;
        self
    }

    /// Sets row limits.
    pub fn limit(mut self, limit: Limit) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Maps each result row to a fact with the given fields.
    pub fn project(mut self, fields: Vec<(&str, Binding)>) -> Self {
        self.projection = Some(owned(fields));
        self
    }

    /// Fails compilation unless the pipeline can run incrementally.
    pub fn require_incremental(mut self) -> Self {
        self.incremental_required = true;
        self
    }

    /// Stages in order.
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Sort keys.
    pub fn sort_fields(&self) -> &[SortField] {
        &self.sort
    }

    /// Grouping keys.
    pub fn group_fields(&self) -> &[FieldRef] {
        &self.group
    }

    /// Row limits.
    pub fn limits(&self) -> Option<&Limit> {
        self.limit.as_ref()
    }

    /// Projection map, if any.
    pub fn projection(&self) -> Option<&[(String, Binding)]> {
        self.projection.as_deref()
    }

    /// Returns true if `require_incremental` was called.
    pub fn incremental_required(&self) -> bool {
        self.incremental_required
    }

    /// Distinct tables read by select stages, in stage order.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = Vec::new();
        for spec in &self.stages {
            if let Stage::Select { table, .. } = &spec.stage {
                if !tables.contains(&table.as_str()) {
                    tables.push(table.as_str());
                }
            }
        }
        tables
    }

    /// Compiles the query into an executable plan.
    pub fn compile(&self, store: &Store, registry: &FunctionRegistry) -> Result<QueryPlan, CompileError> {
        compile_query(self, store, registry)
    }
}
