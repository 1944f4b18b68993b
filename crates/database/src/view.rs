//! Registered views.

use cairn_core::CompileError;
use cairn_query::{FunctionRegistry, Query, Union, ViewPlan};
use cairn_storage::Store;
use std::rc::Rc;

/// The definition a view was registered with.
#[derive(Clone, Debug, PartialEq)]
pub enum ViewDefinition {
    /// A query pipeline.
    Query(Query),
    /// A union of tables.
    Union(Union),
}

impl ViewDefinition {
    pub(crate) fn compile(
        &self,
        store: &Store,
        registry: &FunctionRegistry,
    ) -> Result<Rc<dyn ViewPlan>, CompileError> {
        let plan: Rc<dyn ViewPlan> = match self {
            ViewDefinition::Query(query) => Rc::new(query.compile(store, registry)?),
            ViewDefinition::Union(union) => Rc::new(union.compile(store)?),
        };
        Ok(plan)
    }
}

pub(crate) struct ViewEntry {
    /// Registration order; views run in this order within a round.
    pub(crate) seq: u64,
    pub(crate) definition: ViewDefinition,
    /// None while detached.
    pub(crate) plan: Option<Rc<dyn ViewPlan>>,
}

impl ViewEntry {
    pub(crate) fn is_attached(&self) -> bool {
        self.plan.is_some()
    }

    pub(crate) fn reads(&self) -> Vec<String> {
        self.plan
            .as_ref()
            .map(|plan| plan.reads().to_vec())
            .unwrap_or_default()
    }
}
