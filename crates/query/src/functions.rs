//! Function registry for calculate and aggregate stages.
//!
//! Functions are looked up by name at compile time. Each declares named
//! parameters; bindings are matched to parameters by name and passed
//! positionally in declaration order.

use cairn_core::{Error, Result, Value};
use hashbrown::HashMap;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// Scalar function body. `Ok(None)` means "no value": the row is dropped.
pub type ScalarFn = Rc<dyn Fn(&[Value]) -> Result<Option<Value>>>;

/// Multi-valued function body. Each returned value becomes its own row; an
/// empty vector drops the row.
pub type ExpandFn = Rc<dyn Fn(&[Value]) -> Result<Vec<Value>>>;

/// Creates a fresh accumulator for one group.
pub type AccumulatorFactory = Rc<dyn Fn() -> Box<dyn Accumulator>>;

/// Running state of an aggregate over one group.
pub trait Accumulator {
    /// Folds one row's arguments into the state.
    fn step(&mut self, args: &[Value]) -> Result<()>;

    /// Returns the aggregate value.
    fn finish(&self) -> Value;
}

/// What a function may be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    /// Keeps or drops a row.
    Filter,
    /// Computes a value per row.
    Calculate,
    /// Computes any number of values per row, one output row each.
    Expand,
    /// Folds rows into one value per group.
    Aggregate,
}

impl FunctionKind {
    /// Lower-case name used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionKind::Filter => "filter",
            FunctionKind::Calculate => "calculation",
            FunctionKind::Expand => "multi-valued calculation",
            FunctionKind::Aggregate => "aggregate",
        }
    }
}

#[derive(Clone)]
pub(crate) enum FunctionImpl {
    Scalar(ScalarFn),
    Expand(ExpandFn),
    Aggregate(AccumulatorFactory),
}

/// A registered function.
#[derive(Clone)]
pub struct FunctionDef {
    name: String,
    kind: FunctionKind,
    params: Vec<String>,
    pub(crate) imp: FunctionImpl,
}

impl FunctionDef {
    /// Function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Function kind.
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// Declared parameters, in call order.
    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("params", &self.params)
            .finish()
    }
}

/// Named functions available to queries.
#[derive(Clone, Debug)]
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionDef>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl FunctionRegistry {
    /// Creates a registry with no functions.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Creates a registry holding the builtin functions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        register_builtins(&mut registry);
        registry
    }

    /// Looks up a function.
    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    /// Returns true if a function with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if no function is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn insert(&mut self, name: &str, kind: FunctionKind, params: &[&str], imp: FunctionImpl) {
        self.functions.insert(
            name.to_string(),
            FunctionDef {
                name: name.to_string(),
                kind,
                params: params.iter().map(|p| p.to_string()).collect(),
                imp,
            },
        );
    }

    /// Defines a filter. Rows for which it returns false are dropped.
    pub fn define_filter<F>(&mut self, name: &str, params: &[&str], func: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<bool> + 'static,
    {
        let scalar: ScalarFn = Rc::new(move |args: &[Value]| func(args).map(|keep| Some(Value::Boolean(keep))));
        self.insert(name, FunctionKind::Filter, params, FunctionImpl::Scalar(scalar));
        self
    }

    /// Defines a calculation. Returning `Ok(None)` drops the row.
    pub fn define_calculate<F>(&mut self, name: &str, params: &[&str], func: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Option<Value>> + 'static,
    {
        self.insert(name, FunctionKind::Calculate, params, FunctionImpl::Scalar(Rc::new(func)));
        self
    }

    /// Defines a multi-valued calculation.
    ///
    /// One input row fans out into a row per returned value. Returning an
    /// empty vector drops the row.
    pub fn define_expand<F>(&mut self, name: &str, params: &[&str], func: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>> + 'static,
    {
        self.insert(name, FunctionKind::Expand, params, FunctionImpl::Expand(Rc::new(func)));
        self
    }

    /// Defines an aggregate from an accumulator constructor.
    pub fn define_aggregate<F, A>(&mut self, name: &str, params: &[&str], init: F) -> &mut Self
    where
        F: Fn() -> A + 'static,
        A: Accumulator + 'static,
    {
        let factory: AccumulatorFactory = Rc::new(move || Box::new(init()) as Box<dyn Accumulator>);
        self.insert(name, FunctionKind::Aggregate, params, FunctionImpl::Aggregate(factory));
        self
    }
}

fn register_builtins(registry: &mut FunctionRegistry) {
    registry
        .define_filter("=", &["a", "b"], |args| Ok(args[0].compare(&args[1]) == Some(Ordering::Equal)))
        .define_filter("!=", &["a", "b"], |args| Ok(args[0].compare(&args[1]) != Some(Ordering::Equal)))
        .define_filter("<", &["a", "b"], |args| Ok(args[0].compare(&args[1]) == Some(Ordering::Less)))
        .define_filter("<=", &["a", "b"], |args| {
            Ok(matches!(args[0].compare(&args[1]), Some(Ordering::Less | Ordering::Equal)))
        })
        .define_filter(">", &["a", "b"], |args| Ok(args[0].compare(&args[1]) == Some(Ordering::Greater)))
        .define_filter(">=", &["a", "b"], |args| {
            Ok(matches!(args[0].compare(&args[1]), Some(Ordering::Greater | Ordering::Equal)))
        })
        .define_calculate("+", &["a", "b"], |args| {
            arithmetic("+", &args[0], &args[1], i64::checked_add, |a, b| a + b)
        })
        .define_calculate("-", &["a", "b"], |args| {
            arithmetic("-", &args[0], &args[1], i64::checked_sub, |a, b| a - b)
        })
        .define_calculate("*", &["a", "b"], |args| {
            arithmetic("*", &args[0], &args[1], i64::checked_mul, |a, b| a * b)
        })
        .define_calculate("/", &["a", "b"], |args| Ok(divide(&args[0], &args[1])))
        .define_calculate("concat", &["a", "b"], |args| {
            Ok(Some(Value::String(format!(
                "{}{}",
                concat_text(&args[0]),
                concat_text(&args[1])
            ))))
        })
        .define_expand("range", &["from", "to"], |args| Ok(range(&args[0], &args[1])))
        .define_expand("split", &["text", "separator"], |args| Ok(split(&args[0], &args[1])))
        .define_aggregate("count", &[], Count::default)
        .define_aggregate("sum", &["value"], Sum::default)
        .define_aggregate("average", &["value"], Average::default)
        .define_aggregate("min", &["value"], || Extreme::new(false))
        .define_aggregate("max", &["value"], || Extreme::new(true));
}

fn arithmetic(
    name: &str,
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Option<Value>> {
    match (a, b) {
        (Value::Int64(x), Value::Int64(y)) => int_op(*x, *y)
            .map(|v| Some(Value::Int64(v)))
            .ok_or_else(|| Error::evaluation(name, format!("integer overflow on {} {} {}", x, name, y))),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok(Some(Value::Float64(float_op(x, y)))),
            _ => Ok(None),
        },
    }
}

fn divide(a: &Value, b: &Value) -> Option<Value> {
    let (x, y) = (a.as_number()?, b.as_number()?);
    if y == 0.0 {
        return None;
    }
    Some(Value::Float64(x / y))
}

/// Integers in `[from, to)`. Non-integer bounds yield nothing.
fn range(from: &Value, to: &Value) -> Vec<Value> {
    match (from.as_i64(), to.as_i64()) {
        (Some(from), Some(to)) => (from..to).map(Value::Int64).collect(),
        _ => Vec::new(),
    }
}

fn split(text: &Value, separator: &Value) -> Vec<Value> {
    match (text.as_str(), separator.as_str()) {
        (Some(text), Some(sep)) if !sep.is_empty() => text.split(sep).map(Value::from).collect(),
        _ => Vec::new(),
    }
}

fn concat_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Default)]
struct Count {
    rows: i64,
}

impl Accumulator for Count {
    fn step(&mut self, _args: &[Value]) -> Result<()> {
        self.rows += 1;
        Ok(())
    }

    fn finish(&self) -> Value {
        Value::Int64(self.rows)
    }
}

/// Int64 while every input is an integer, Float64 otherwise. Nulls and
/// non-numeric values are skipped.
#[derive(Default)]
struct Sum {
    int: i64,
    float: f64,
    saw_float: bool,
}

impl Accumulator for Sum {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        match &args[0] {
            Value::Int64(i) => {
                self.int = self
                    .int
                    .checked_add(*i)
                    .ok_or_else(|| Error::evaluation("sum", "integer overflow"))?;
            }
            Value::Float64(f) => {
                self.float += f;
                self.saw_float = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        if self.saw_float {
            Value::Float64(self.int as f64 + self.float)
        } else {
            Value::Int64(self.int)
        }
    }
}

#[derive(Default)]
struct Average {
    total: f64,
    count: usize,
}

impl Accumulator for Average {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        if let Some(n) = args[0].as_number() {
            self.total += n;
            self.count += 1;
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        if self.count == 0 {
            Value::Null
        } else {
            Value::Float64(self.total / self.count as f64)
        }
    }
}

struct Extreme {
    max: bool,
    best: Option<Value>,
}

impl Extreme {
    fn new(max: bool) -> Self {
        Self { max, best: None }
    }
}

impl Accumulator for Extreme {
    fn step(&mut self, args: &[Value]) -> Result<()> {
        let value = &args[0];
        if value.is_null() || value.as_f64().is_some_and(f64::is_nan) {
            return Ok(());
        }
        let wanted = if self.max { Ordering::Greater } else { Ordering::Less };
        let better = match &self.best {
            None => true,
            Some(best) => value.compare(best) == Some(wanted),
        };
        if better {
            self.best = Some(value.clone());
        }
        Ok(())
    }

    fn finish(&self) -> Value {
        self.best.clone().unwrap_or(Value::Null)
    }
}
