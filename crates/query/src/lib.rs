//! Cairn Query - view compiler and executor for the Cairn incremental engine.
//!
//! This crate turns declarative view definitions into executable plans:
//!
//! - `query`: the `Query` builder (select, deselect, calculate, aggregate, sort, group, limit, project)
//! - `compile`: alias and function resolution into a closure pipeline
//! - `executor`: full and incremental execution of compiled queries
//! - `union`: deduplicating merges of field-mapped tables
//! - `functions`: the filter, calculation and aggregate registry
//! - `plan`: the `ViewPlan` interface the scheduler drives
//!
//! ```rust
//! use cairn_core::fact;
//! use cairn_query::{Binding, FunctionRegistry, Query, ViewPlan};
//! use cairn_storage::{Keys, Store, TableKind};
//!
//! let mut store = Store::new();
//! store
//!     .create_table("people", TableKind::Base, Keys::from_fields(["name"]))
//!     .apply(vec![fact! { "name" => "Amy", "age" => 30 }, fact! { "name" => "Bo", "age" => 17 }], vec![]);
//!
//! let adults = Query::new()
//!     .select("people", vec![], Some("p"))
//!     .calculate(">", vec![("a", Binding::field("p", "age")), ("b", Binding::value(21))], None)
//!     .project(vec![("name", Binding::field("p", "name"))]);
//! let plan = adults.compile(&store, &FunctionRegistry::with_builtins()).unwrap();
//! assert_eq!(plan.execute_full(&store).unwrap().len(), 1);
//! ```

mod aggregate;
mod binding;
mod compile;
mod executor;
mod functions;
mod plan;
mod query;
mod row;
mod union;

pub use binding::{Binding, FieldRef, Limit, SortDirection, SortField};
pub use compile::QueryPlan;
pub use functions::{
    Accumulator, AccumulatorFactory, ExpandFn, FunctionDef, FunctionKind, FunctionRegistry, ScalarFn,
};
pub use plan::ViewPlan;
pub use query::{Query, Stage, StageSpec};
pub use union::{MemberField, Union, UnionMember, UnionPlan};
