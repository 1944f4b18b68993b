//! Query compilation.
//!
//! Resolves aliases and functions once and turns each stage into an operator
//! closure over join rows. The resulting `QueryPlan` holds no per-row state.

use crate::aggregate::{AggregateOp, PostProcess};
use crate::binding::{Binding, FieldRef};
use crate::functions::{ExpandFn, FunctionDef, FunctionImpl, FunctionKind, FunctionRegistry, ScalarFn};
use crate::query::{Query, Stage};
use crate::row::{field_of, literal, result_of, Accessor, ExecContext, JoinRow, Slot};
use cairn_core::{CompileError, Fact, Result, Value};
use cairn_storage::Store;
use hashbrown::HashMap;
use std::fmt;

/// Expands one join row into zero or more rows.
pub(crate) type StageOp = Box<dyn Fn(&ExecContext<'_>, &JoinRow, &mut Vec<JoinRow>) -> Result<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StageRole {
    Select,
    Negated,
    Filter,
    Value,
    Aggregate,
}

/// A join constraint from a select stage back to an earlier select stage.
#[derive(Clone, Debug)]
pub(crate) struct Link {
    pub(crate) field: String,
    pub(crate) prev_stage: usize,
    pub(crate) prev_field: String,
}

/// A compiled query.
pub struct QueryPlan {
    pub(crate) labels: Vec<String>,
    pub(crate) roles: Vec<StageRole>,
    pub(crate) tables: Vec<Option<String>>,
    pub(crate) ops: Vec<StageOp>,
    pub(crate) links: Vec<Vec<Link>>,
    pub(crate) reads: Vec<String>,
    pub(crate) post: Option<PostProcess>,
    pub(crate) projection: Option<Vec<(String, Accessor)>>,
    pub(crate) incremental: bool,
    pub(crate) index_requests: Vec<(String, Vec<String>)>,
    /// Stages whose function fans a row out into several.
    pub(crate) expansions: Vec<usize>,
}

impl QueryPlan {
    /// Number of stages.
    pub fn stage_count(&self) -> usize {
        self.roles.len()
    }

    /// Returns true if the plan has an ordering, grouping, limit or aggregate step.
    pub fn has_post_processing(&self) -> bool {
        self.post.is_some()
    }
}

impl fmt::Debug for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPlan")
            .field("labels", &self.labels)
            .field("roles", &self.roles)
            .field("reads", &self.reads)
            .field("incremental", &self.incremental)
            .finish_non_exhaustive()
    }
}

/// Names and roles of the stages compiled so far.
#[derive(Default)]
struct Scope {
    aliases: HashMap<String, usize>,
    roles: Vec<StageRole>,
}

impl Scope {
    fn define(&mut self, alias: Option<&str>, role: StageRole) -> std::result::Result<(), CompileError> {
        let ix = self.roles.len();
        self.roles.push(role);
        if let Some(alias) = alias {
            if self.aliases.insert(alias.to_string(), ix).is_some() {
                return Err(CompileError::InvalidReference {
                    alias: alias.to_string(),
                    message: "alias is defined twice".into(),
                });
            }
        }
        Ok(())
    }

    /// Resolves a stage reference made from stage `from`.
    fn resolve(&self, from: usize, reference: &FieldRef) -> std::result::Result<usize, CompileError> {
        let target = self
            .aliases
            .get(&reference.stage)
            .copied()
            .or_else(|| reference.stage.parse::<usize>().ok());
        match target {
            Some(ix) if ix < self.roles.len() && ix < from => Ok(ix),
            _ => Err(CompileError::UnknownAlias {
                stage: from,
                alias: reference.stage.clone(),
            }),
        }
    }

    fn accessor(
        &self,
        from: usize,
        binding: &Binding,
        allow_aggregate: bool,
    ) -> std::result::Result<Accessor, CompileError> {
        let reference = match binding {
            Binding::Literal(value) => return Ok(literal(value.clone())),
            Binding::Field(reference) => reference,
        };
        let ix = self.resolve(from, reference)?;
        let invalid = |message: &str| CompileError::InvalidReference {
            alias: reference.stage.clone(),
            message: message.to_string(),
        };
        match (self.roles[ix], &reference.field) {
            (StageRole::Select, Some(field)) => Ok(field_of(ix, field.clone())),
            (StageRole::Select, None) => Err(invalid("select stage referenced without a field")),
            (StageRole::Negated, _) => Err(invalid("negated stage binds no row")),
            (StageRole::Filter, _) => Err(invalid("filter stage has no result")),
            (StageRole::Value | StageRole::Aggregate, Some(_)) => {
                Err(invalid("result stage referenced with a field"))
            }
            (StageRole::Aggregate, None) if !allow_aggregate => Err(CompileError::AggregateReference {
                alias: reference.stage.clone(),
            }),
            (StageRole::Value | StageRole::Aggregate, None) => Ok(result_of(ix)),
        }
    }

    fn arguments(
        &self,
        from: usize,
        def: &FunctionDef,
        args: &[(String, Binding)],
    ) -> std::result::Result<Vec<Accessor>, CompileError> {
        if let Some((name, _)) = args.iter().find(|(name, _)| !def.params().contains(name)) {
            return Err(CompileError::UnknownArgument {
                function: def.name().to_string(),
                argument: name.clone(),
            });
        }
        def.params()
            .iter()
            .map(|param| {
                let binding = args
                    .iter()
                    .find(|(name, _)| name == param)
                    .map(|(_, b)| b)
                    .ok_or_else(|| CompileError::MissingArgument {
                        function: def.name().to_string(),
                        argument: param.clone(),
                    })?;
                self.accessor(from, binding, false)
            })
            .collect()
    }
}

fn lookup_function<'r>(
    registry: &'r FunctionRegistry,
    name: &str,
) -> std::result::Result<&'r FunctionDef, CompileError> {
    registry.get(name).ok_or_else(|| CompileError::UnknownFunction {
        name: name.to_string(),
    })
}

fn wrong_kind(def: &FunctionDef, expected: &'static str) -> CompileError {
    CompileError::WrongFunctionKind {
        name: def.name().to_string(),
        expected,
        actual: def.kind().as_str(),
    }
}

fn evaluate(args: &[Accessor], row: &JoinRow) -> Option<Vec<Value>> {
    args.iter().map(|a| a(row)).collect()
}

fn select_op(stage: usize, table: String, lookups: Vec<(String, Accessor)>, negated: bool) -> StageOp {
    Box::new(
        move |ctx: &ExecContext<'_>, row: &JoinRow, out: &mut Vec<JoinRow>| -> Result<()> {
            let mut pattern = Fact::new();
            for (field, accessor) in &lookups {
                match accessor(row) {
                    Some(value) => {
                        pattern.insert(field.as_str(), value);
                    }
                    None => return Ok(()),
                }
            }

            if negated {
                let blocked = ctx
                    .store
                    .table(&table)
                    .is_some_and(|t| !t.lookup(&pattern).is_empty());
                if !blocked {
                    out.push(row.clone());
                }
                return Ok(());
            }

            let matches = match ctx.pinned(stage) {
                Some(pinned) => pinned
                    .iter()
                    .filter(|(_, fact)| fact.matches(&pattern))
                    .cloned()
                    .collect(),
                None => ctx
                    .store
                    .table(&table)
                    .map(|t| t.lookup(&pattern))
                    .unwrap_or_default(),
            };
            for (id, fact) in matches {
                let mut next = row.clone();
                next.set(stage, Slot::Fact(id, fact));
                out.push(next);
            }
            Ok(())
        },
    )
}

fn filter_op(args: Vec<Accessor>, func: ScalarFn) -> StageOp {
    Box::new(
        move |_ctx: &ExecContext<'_>, row: &JoinRow, out: &mut Vec<JoinRow>| -> Result<()> {
            let Some(values) = evaluate(&args, row) else {
                return Ok(());
            };
            if matches!(func(&values)?, Some(Value::Boolean(true))) {
                out.push(row.clone());
            }
            Ok(())
        },
    )
}

fn calculate_op(stage: usize, args: Vec<Accessor>, func: ScalarFn) -> StageOp {
    Box::new(
        move |_ctx: &ExecContext<'_>, row: &JoinRow, out: &mut Vec<JoinRow>| -> Result<()> {
            let Some(values) = evaluate(&args, row) else {
                return Ok(());
            };
            if let Some(value) = func(&values)? {
                let mut next = row.clone();
                next.set(stage, Slot::Value(value));
                out.push(next);
            }
            Ok(())
        },
    )
}

fn expand_op(stage: usize, args: Vec<Accessor>, func: ExpandFn) -> StageOp {
    Box::new(
        move |_ctx: &ExecContext<'_>, row: &JoinRow, out: &mut Vec<JoinRow>| -> Result<()> {
            let Some(values) = evaluate(&args, row) else {
                return Ok(());
            };
            for value in func(&values)? {
                let mut next = row.clone();
                next.set(stage, Slot::Value(value));
                out.push(next);
            }
            Ok(())
        },
    )
}

fn push_request(requests: &mut Vec<(String, Vec<String>)>, table: &str, mut fields: Vec<String>) {
    fields.sort();
    fields.dedup();
    if fields.is_empty() {
        return;
    }
    if !requests.iter().any(|(t, f)| t == table && *f == fields) {
        requests.push((table.to_string(), fields));
    }
}

/// Compiles `query` against the tables of `store` and the functions of `registry`.
pub(crate) fn compile_query(
    query: &Query,
    store: &Store,
    registry: &FunctionRegistry,
) -> std::result::Result<QueryPlan, CompileError> {
    let specs = query.stages();
    match specs.first().map(|s| &s.stage) {
        Some(Stage::Select { negated: false, .. }) => {}
        _ => return Err(CompileError::InvalidRoot),
    }

    let mut scope = Scope::default();
    let mut labels = Vec::with_capacity(specs.len());
    let mut tables = Vec::with_capacity(specs.len());
    let mut ops = Vec::with_capacity(specs.len());
    let mut links = Vec::with_capacity(specs.len());
    let mut aggregates = Vec::new();
    let mut reads: Vec<String> = Vec::new();
    let mut index_requests = Vec::new();
    let mut expansions = Vec::new();

    for (ix, spec) in specs.iter().enumerate() {
        let mut stage_links = Vec::new();
        let mut stage_table = None;
        let role = match &spec.stage {
            Stage::Select {
                table,
                bindings,
                negated,
            } => {
                if !store.has_table(table) {
                    return Err(CompileError::UnknownTable {
                        table: table.clone(),
                    });
                }
                let mut lookups = Vec::with_capacity(bindings.len());
                for (field, binding) in bindings {
                    let accessor = scope.accessor(ix, binding, false)?;
                    if let Binding::Field(
                        reference @ FieldRef {
                            field: Some(prev_field),
                            ..
                        },
                    ) = binding
                    {
                        let prev_stage = scope.resolve(ix, reference)?;
                        stage_links.push(Link {
                            field: field.clone(),
                            prev_stage,
                            prev_field: prev_field.clone(),
                        });
                    }
                    lookups.push((field.clone(), accessor));
                }
                push_request(
                    &mut index_requests,
                    table,
                    bindings.iter().map(|(f, _)| f.clone()).collect(),
                );
                if !reads.contains(table) {
                    reads.push(table.clone());
                }
                stage_table = Some(table.clone());
                ops.push(select_op(ix, table.clone(), lookups, *negated));
                if *negated {
                    StageRole::Negated
                } else {
                    StageRole::Select
                }
            }
            Stage::Calculate { function, args } => {
                let def = lookup_function(registry, function)?;
                let accessors = scope.arguments(ix, def, args)?;
                match (&def.imp, def.kind()) {
                    (FunctionImpl::Scalar(func), FunctionKind::Filter) => {
                        ops.push(filter_op(accessors, func.clone()));
                        StageRole::Filter
                    }
                    (FunctionImpl::Scalar(func), FunctionKind::Calculate) => {
                        ops.push(calculate_op(ix, accessors, func.clone()));
                        StageRole::Value
                    }
                    (FunctionImpl::Expand(func), FunctionKind::Expand) => {
                        ops.push(expand_op(ix, accessors, func.clone()));
                        expansions.push(ix);
                        StageRole::Value
                    }
                    _ => return Err(wrong_kind(def, "calculation")),
                }
            }
            Stage::Aggregate { function, args } => {
                let def = lookup_function(registry, function)?;
                let FunctionImpl::Aggregate(factory) = &def.imp else {
                    return Err(wrong_kind(def, "aggregate"));
                };
                let accessors = scope.arguments(ix, def, args)?;
                aggregates.push(AggregateOp {
                    stage: ix,
                    factory: factory.clone(),
                    args: accessors,
                });
                StageRole::Aggregate
            }
        };
        scope.define(spec.alias.as_deref(), role)?;
        labels.push(spec.alias.clone().unwrap_or_else(|| ix.to_string()));
        tables.push(stage_table);
        links.push(stage_links);
    }

    // the reverse join looks up earlier stages by the linked fields
    for stage_links in &links {
        let mut by_stage: HashMap<usize, Vec<String>> = HashMap::new();
        for link in stage_links {
            by_stage.entry(link.prev_stage).or_default().push(link.prev_field.clone());
        }
        let mut targets: Vec<(usize, Vec<String>)> = by_stage.into_iter().collect();
        targets.sort_by_key(|(stage, _)| *stage);
        for (stage, fields) in targets {
            if let Some(table) = &tables[stage] {
                push_request(&mut index_requests, table, fields);
            }
        }
    }

    let end = specs.len();
    let group = query
        .group_fields()
        .iter()
        .map(|r| scope.accessor(end, &Binding::Field(r.clone()), false))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let sort = query
        .sort_fields()
        .iter()
        .map(|s| {
            scope
                .accessor(end, &Binding::Field(s.field.clone()), false)
                .map(|a| (a, s.direction))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let projection = match query.projection() {
        Some(fields) => Some(
            fields
                .iter()
                .map(|(name, binding)| scope.accessor(end, binding, true).map(|a| (name.clone(), a)))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        None => None,
    };

    let blocker = if scope.roles.contains(&StageRole::Negated) {
        Some("negated select")
    } else if !aggregates.is_empty() {
        Some("aggregate")
    } else if !sort.is_empty() {
        Some("sort")
    } else if !group.is_empty() {
        Some("group")
    } else if query.limits().is_some() {
        Some("limit")
    } else {
        None
    };
    if let (true, Some(reason)) = (query.incremental_required(), blocker) {
        return Err(CompileError::NotIncremental {
            reason: reason.to_string(),
        });
    }

    let needs_post = !aggregates.is_empty() || !sort.is_empty() || !group.is_empty() || query.limits().is_some();
    let post = needs_post.then(|| PostProcess {
        group,
        sort,
        limit: query.limits().copied().unwrap_or_default(),
        aggregates,
    });

    Ok(QueryPlan {
        labels,
        roles: scope.roles,
        tables,
        ops,
        links,
        reads,
        post,
        projection,
        incremental: blocker.is_none(),
        index_requests,
        expansions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{Limit, SortField};
    use cairn_storage::{Keys, TableKind};

    fn store() -> Store {
        let mut store = Store::new();
        store.create_table("people", TableKind::Base, Keys::from_fields(["name"]));
        store.create_table("pets", TableKind::Base, Keys::Content);
        store
    }

    fn compile(query: Query) -> std::result::Result<QueryPlan, CompileError> {
        query.compile(&store(), &FunctionRegistry::with_builtins())
    }

    #[test]
    fn test_simple_select_is_incremental() {
        let plan = compile(Query::new().select("people", vec![], Some("p"))).unwrap();
        assert!(plan.incremental);
        assert_eq!(plan.reads, vec!["people".to_string()]);
        assert_eq!(plan.stage_count(), 1);
    }

    #[test]
    fn test_unknown_table() {
        let err = compile(Query::new().select("nope", vec![], None)).unwrap_err();
        assert_eq!(err, CompileError::UnknownTable { table: "nope".into() });
    }

    #[test]
    fn test_invalid_root() {
        let err = compile(Query::new().deselect("people", vec![], None)).unwrap_err();
        assert_eq!(err, CompileError::InvalidRoot);
        assert_eq!(compile(Query::new()).unwrap_err(), CompileError::InvalidRoot);
    }

    #[test]
    fn test_later_alias_is_unknown() {
        let err = compile(
            Query::new()
                .select("people", vec![("name", Binding::field("q", "owner"))], Some("p"))
                .select("pets", vec![], Some("q")),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownAlias { stage: 0, .. }));
    }

    #[test]
    fn test_numeric_stage_reference() {
        let plan = compile(
            Query::new()
                .select("people", vec![], None)
                .select("pets", vec![("owner", Binding::field("0", "name"))], None),
        )
        .unwrap();
        assert_eq!(plan.links[1].len(), 1);
        assert_eq!(plan.labels, vec!["0".to_string(), "1".to_string()]);
    }

    #[test]
    fn test_invalid_references() {
        let err = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .select("pets", vec![("owner", Binding::result("p"))], None),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidReference { .. }));

        let err = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .calculate("+", vec![("a", Binding::value(1)), ("b", Binding::value(2))], Some("s"))
                .select("pets", vec![("owner", Binding::field("s", "x"))], None),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidReference { .. }));
    }

    #[test]
    fn test_function_errors() {
        let base = || Query::new().select("people", vec![], Some("p"));
        assert!(matches!(
            compile(base().calculate("nope", vec![], None)).unwrap_err(),
            CompileError::UnknownFunction { .. }
        ));
        assert!(matches!(
            compile(base().calculate("sum", vec![("value", Binding::value(1))], None)).unwrap_err(),
            CompileError::WrongFunctionKind { .. }
        ));
        assert!(matches!(
            compile(base().aggregate("+", vec![], None)).unwrap_err(),
            CompileError::WrongFunctionKind { .. }
        ));
        assert!(matches!(
            compile(base().calculate("+", vec![("a", Binding::value(1))], None)).unwrap_err(),
            CompileError::MissingArgument { .. }
        ));
        assert!(matches!(
            compile(base().calculate(
                "+",
                vec![("a", Binding::value(1)), ("b", Binding::value(1)), ("c", Binding::value(1))],
                None
            ))
            .unwrap_err(),
            CompileError::UnknownArgument { .. }
        ));
    }

    #[test]
    fn test_aggregate_only_in_projection() {
        let base = || {
            Query::new()
                .select("people", vec![], Some("p"))
                .aggregate("count", vec![], Some("n"))
        };
        assert!(compile(base().project(vec![("total", Binding::result("n"))])).is_ok());

        let err = compile(base().calculate(
            ">",
            vec![("a", Binding::result("n")), ("b", Binding::value(1))],
            None,
        ))
        .unwrap_err();
        assert_eq!(err, CompileError::AggregateReference { alias: "n".into() });

        let err = compile(base().sort(vec![SortField::asc(FieldRef::result("n"))])).unwrap_err();
        assert_eq!(err, CompileError::AggregateReference { alias: "n".into() });
    }

    #[test]
    fn test_require_incremental() {
        let err = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .limit(Limit::new().results(1))
                .require_incremental(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::NotIncremental { .. }));

        let plan = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .calculate(">", vec![("a", Binding::field("p", "age")), ("b", Binding::value(21))], None)
                .require_incremental(),
        )
        .unwrap();
        assert!(plan.incremental);
    }

    #[test]
    fn test_negation_is_full_only() {
        let plan = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .deselect("pets", vec![("owner", Binding::field("p", "name"))], None),
        )
        .unwrap();
        assert!(!plan.incremental);
        assert!(!plan.has_post_processing());
    }

    #[test]
    fn test_index_requests() {
        let plan = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .select("pets", vec![("owner", Binding::field("p", "name"))], Some("x")),
        )
        .unwrap();
        assert!(plan
            .index_requests
            .contains(&("pets".to_string(), vec!["owner".to_string()])));
        assert!(plan
            .index_requests
            .contains(&("people".to_string(), vec!["name".to_string()])));
    }

    #[test]
    fn test_expansion_stays_incremental() {
        let plan = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .calculate("range", vec![("from", Binding::value(0)), ("to", Binding::field("p", "age"))], Some("n"))
                .project(vec![("name", Binding::field("p", "name")), ("n", Binding::result("n"))]),
        )
        .unwrap();
        assert!(plan.incremental);
        assert_eq!(plan.expansions, vec![1]);
    }

    #[test]
    fn test_duplicate_alias() {
        let err = compile(
            Query::new()
                .select("people", vec![], Some("p"))
                .select("pets", vec![], Some("p")),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidReference { .. }));
    }
}
