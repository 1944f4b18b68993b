//! Ordering, grouping, limiting and aggregate folding.
//!
//! Runs over the materialized rows of a full execution: rows are ordered by
//! group keys then sort keys, each group keeps `per_group` rows after skipping
//! `offset`, aggregates fold over the kept rows of each group, and the total is
//! finally capped at `results`.

use crate::binding::{Limit, SortDirection};
use crate::functions::AccumulatorFactory;
use crate::row::{Accessor, JoinRow, Slot};
use cairn_core::{Result, Value};
use std::cmp::Ordering;

/// One aggregate stage ready to fold.
pub(crate) struct AggregateOp {
    pub(crate) stage: usize,
    pub(crate) factory: AccumulatorFactory,
    pub(crate) args: Vec<Accessor>,
}

/// Post-processing shared by every full execution of a plan.
pub(crate) struct PostProcess {
    pub(crate) group: Vec<Accessor>,
    pub(crate) sort: Vec<(Accessor, SortDirection)>,
    pub(crate) limit: Limit,
    pub(crate) aggregates: Vec<AggregateOp>,
}

struct Keyed {
    group: Vec<Value>,
    sort: Vec<Value>,
    row: JoinRow,
}

fn keys(accessors: &[Accessor], row: &JoinRow) -> Vec<Value> {
    // missing values sort as null
    accessors
        .iter()
        .map(|a| a(row).unwrap_or(Value::Null))
        .collect()
}

impl PostProcess {
    fn compare(&self, a: &Keyed, b: &Keyed) -> Ordering {
        a.group.cmp(&b.group).then_with(|| {
            for (i, (_, direction)) in self.sort.iter().enumerate() {
                let ord = a.sort[i].cmp(&b.sort[i]);
                let ord = match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        })
    }

    /// Orders, groups, limits and folds `rows`.
    pub(crate) fn apply(&self, rows: Vec<JoinRow>) -> Result<Vec<JoinRow>> {
        let mut keyed: Vec<Keyed> = rows
            .into_iter()
            .map(|row| Keyed {
                group: keys(&self.group, &row),
                sort: self.sort.iter().map(|(a, _)| a(&row).unwrap_or(Value::Null)).collect(),
                row,
            })
            .collect();
        // stable: ties keep execution order
        keyed.sort_by(|a, b| self.compare(a, b));

        let mut output = Vec::new();
        let mut start = 0;
        while start < keyed.len() {
            let mut end = start + 1;
            while end < keyed.len() && keyed[end].group == keyed[start].group {
                end += 1;
            }

            let take = self.limit.per_group.unwrap_or(usize::MAX);
            let mut kept: Vec<JoinRow> = keyed[start..end]
                .iter()
                .skip(self.limit.offset)
                .take(take)
                .map(|k| k.row.clone())
                .collect();
            self.fold(&mut kept)?;
            output.extend(kept);
            start = end;
        }

        if let Some(results) = self.limit.results {
            output.truncate(results);
        }
        Ok(output)
    }

    fn fold(&self, group: &mut [JoinRow]) -> Result<()> {
        for op in &self.aggregates {
            let mut acc = (op.factory)();
            for row in group.iter() {
                let args: Option<Vec<Value>> = op.args.iter().map(|a| a(row)).collect();
                if let Some(args) = args {
                    acc.step(&args)?;
                }
            }
            let value = acc.finish();
            for row in group.iter_mut() {
                row.set(op.stage, Slot::Value(value.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{FunctionImpl, FunctionRegistry};
    use crate::row::{field_of, result_of};
    use cairn_core::{fact, FactId};
    use std::rc::Rc;

    fn rows(values: &[(i64, i64)]) -> Vec<JoinRow> {
        values
            .iter()
            .map(|(g, n)| {
                let f = Rc::new(fact! { "g" => *g, "n" => *n });
                let mut row = JoinRow::new(2);
                row.set(0, Slot::Fact(FactId::of_content(&f), f));
                row
            })
            .collect()
    }

    fn factory(name: &str) -> AccumulatorFactory {
        let registry = FunctionRegistry::with_builtins();
        match registry.get(name).map(|f| f.imp.clone()) {
            Some(FunctionImpl::Aggregate(factory)) => factory,
            _ => panic!("{} is not an aggregate", name),
        }
    }

    fn ns(rows: &[JoinRow]) -> Vec<i64> {
        rows.iter()
            .filter_map(|r| r.field(0, "n").and_then(Value::as_i64))
            .collect()
    }

    fn post(group: bool, desc: bool, limit: Limit, aggregate: Option<&str>) -> PostProcess {
        PostProcess {
            group: if group { vec![field_of(0, "g".into())] } else { vec![] },
            sort: vec![(
                field_of(0, "n".into()),
                if desc {
                    SortDirection::Descending
                } else {
                    SortDirection::Ascending
                },
            )],
            limit,
            aggregates: aggregate
                .map(|name| AggregateOp {
                    stage: 1,
                    factory: factory(name),
                    args: vec![field_of(0, "n".into())],
                })
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn test_sort_descending_with_results_cap() {
        let p = post(false, true, Limit::new().results(2), None);
        let out = p.apply(rows(&[(0, 3), (0, 9), (0, 5)])).unwrap();
        assert_eq!(ns(&out), vec![9, 5]);
    }

    #[test]
    fn test_offset_and_per_group() {
        let p = post(true, false, Limit::new().offset(1).per_group(1), None);
        let out = p
            .apply(rows(&[(1, 1), (1, 2), (1, 3), (2, 10), (2, 20)]))
            .unwrap();
        assert_eq!(ns(&out), vec![2, 20]);
    }

    #[test]
    fn test_aggregate_resets_per_group() {
        let p = post(true, false, Limit::new(), Some("sum"));
        let out = p.apply(rows(&[(1, 1), (2, 10), (1, 2)])).unwrap();
        let sums: Vec<Option<Value>> = out.iter().map(|r| result_of(1)(r)).collect();
        assert_eq!(
            sums,
            vec![
                Some(Value::Int64(3)),
                Some(Value::Int64(3)),
                Some(Value::Int64(10))
            ]
        );
    }

    #[test]
    fn test_aggregate_folds_only_kept_rows() {
        let p = post(false, true, Limit::new().per_group(2), Some("sum"));
        let out = p.apply(rows(&[(0, 1), (0, 2), (0, 3)])).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(result_of(1)(&out[0]), Some(Value::Int64(5)));
    }

    #[test]
    fn test_empty_input() {
        let p = post(true, false, Limit::new(), Some("count"));
        assert!(p.apply(Vec::new()).unwrap().is_empty());
    }
}
