//! Intermediate join rows and the context plans execute in.

use cairn_core::{Fact, FactId, Value};
use cairn_storage::Store;
use std::collections::BTreeMap;
use std::rc::Rc;

/// What one stage contributed to a join row.
#[derive(Clone, Debug, Default)]
pub(crate) enum Slot {
    /// Nothing: filters, negated selects, and stages not reached yet.
    #[default]
    Empty,
    /// A fact bound by a select stage.
    Fact(FactId, Rc<Fact>),
    /// A calculate or aggregate result.
    Value(Value),
}

/// One candidate row: a slot per stage.
#[derive(Clone, Debug)]
pub(crate) struct JoinRow {
    slots: Vec<Slot>,
}

impl JoinRow {
    pub(crate) fn new(stages: usize) -> Self {
        Self {
            slots: vec![Slot::Empty; stages],
        }
    }

    pub(crate) fn set(&mut self, stage: usize, slot: Slot) {
        self.slots[stage] = slot;
    }

    /// Field of the fact bound at `stage`.
    pub(crate) fn field(&self, stage: usize, field: &str) -> Option<&Value> {
        match &self.slots[stage] {
            Slot::Fact(_, fact) => fact.get(field),
            _ => None,
        }
    }

    /// Result stored at `stage`.
    pub(crate) fn value(&self, stage: usize) -> Option<&Value> {
        match &self.slots[stage] {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Fact bound at `stage`.
    pub(crate) fn fact(&self, stage: usize) -> Option<(FactId, &Rc<Fact>)> {
        match &self.slots[stage] {
            Slot::Fact(id, fact) => Some((*id, fact)),
            _ => None,
        }
    }
}

/// Reads one value out of a join row. `None` drops the row.
pub(crate) type Accessor = Rc<dyn Fn(&JoinRow) -> Option<Value>>;

pub(crate) fn literal(value: Value) -> Accessor {
    Rc::new(move |_: &JoinRow| Some(value.clone()))
}

pub(crate) fn field_of(stage: usize, field: String) -> Accessor {
    Rc::new(move |row: &JoinRow| row.field(stage, &field).cloned())
}

pub(crate) fn result_of(stage: usize) -> Accessor {
    Rc::new(move |row: &JoinRow| row.value(stage).cloned())
}

/// Facts a select stage iterates instead of its table.
pub(crate) type Pins = BTreeMap<usize, Vec<(FactId, Rc<Fact>)>>;

/// Everything a stage operator can see during one execution.
pub(crate) struct ExecContext<'a> {
    pub(crate) store: &'a Store,
    pub(crate) pins: &'a Pins,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn pinned(&self, stage: usize) -> Option<&'a [(FactId, Rc<Fact>)]> {
        self.pins.get(&stage).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::fact;

    #[test]
    fn test_accessors() {
        let f = Rc::new(fact! { "age" => 30 });
        let mut row = JoinRow::new(2);
        row.set(0, Slot::Fact(FactId::of_content(&f), Rc::clone(&f)));
        row.set(1, Slot::Value(Value::Int64(7)));

        assert_eq!(field_of(0, "age".into())(&row), Some(Value::Int64(30)));
        assert_eq!(field_of(0, "name".into())(&row), None);
        assert_eq!(result_of(1)(&row), Some(Value::Int64(7)));
        assert_eq!(result_of(0)(&row), None);
        assert_eq!(literal(Value::from("x"))(&row), Some(Value::from("x")));
    }
}
