//! Argument bindings, field references and post-processing options.

use cairn_core::Value;

/// Reference to a field of an earlier stage, or to a stage's computed result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRef {
    /// Alias of the referenced stage, or its position written as a number.
    pub stage: String,
    /// Field of a select stage; None for calculate and aggregate results.
    pub field: Option<String>,
}

impl FieldRef {
    /// Field `field` of the select stage `stage`.
    pub fn new(stage: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            field: Some(field.into()),
        }
    }

    /// The computed result of the calculate or aggregate stage `stage`.
    pub fn result(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            field: None,
        }
    }
}

/// Value supplied for a join field, function argument or projected field.
#[derive(Clone, Debug, PartialEq)]
pub enum Binding {
    /// A constant.
    Literal(Value),
    /// A value read from an earlier stage.
    Field(FieldRef),
}

impl Binding {
    /// A constant binding.
    pub fn value(value: impl Into<Value>) -> Self {
        Binding::Literal(value.into())
    }

    /// A binding to field `field` of select stage `stage`.
    pub fn field(stage: impl Into<String>, field: impl Into<String>) -> Self {
        Binding::Field(FieldRef::new(stage, field))
    }

    /// A binding to the result of calculate or aggregate stage `stage`.
    pub fn result(stage: impl Into<String>) -> Self {
        Binding::Field(FieldRef::result(stage))
    }
}

impl From<FieldRef> for Binding {
    fn from(field: FieldRef) -> Self {
        Binding::Field(field)
    }
}

/// Sort order of one sort key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// One sort key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortField {
    /// The value sorted on.
    pub field: FieldRef,
    /// Sort order.
    pub direction: SortDirection,
}

impl SortField {
    /// Ascending sort on `field`.
    pub fn asc(field: FieldRef) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    /// Descending sort on `field`.
    pub fn desc(field: FieldRef) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }
}

/// Row limits applied after ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Limit {
    /// Cap on the total number of rows.
    pub results: Option<usize>,
    /// Cap on rows kept per group.
    pub per_group: Option<usize>,
    /// Rows skipped at the start of each group.
    pub offset: usize,
}

impl Limit {
    /// No limits.
    pub const fn new() -> Self {
        Self {
            results: None,
            per_group: None,
            offset: 0,
        }
    }

    /// Caps the total number of rows.
    #[must_use]
    pub const fn results(mut self, n: usize) -> Self {
        self.results = Some(n);
        self
    }

    /// Caps rows per group.
    #[must_use]
    pub const fn per_group(mut self, n: usize) -> Self {
        self.per_group = Some(n);
        self
    }

    /// Skips `n` rows at the start of each group.
    #[must_use]
    pub const fn offset(mut self, n: usize) -> Self {
        self.offset = n;
        self
    }
}
