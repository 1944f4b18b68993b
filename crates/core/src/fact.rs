//! Facts and their identities.
//!
//! A `Fact` is an immutable set of named fields. Inside a table it is
//! identified by a `FactId`, a structural digest of its key fields.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named-field tuple stored in a table.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fact {
    fields: BTreeMap<String, Value>,
}

impl Fact {
    /// Creates an empty fact.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this fact with `field` set to `value`.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(field.into(), value.into())
    }

    /// Returns the value of a field.
    #[inline]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns true if the field is present.
    #[inline]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Number of fields.
    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the fact has no fields.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Iterates field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Returns true if every field of `pattern` is present here with an equal value.
    ///
    /// The empty pattern matches every fact.
    pub fn matches(&self, pattern: &Fact) -> bool {
        pattern
            .fields
            .iter()
            .all(|(name, value)| self.fields.get(name) == Some(value))
    }

    /// Identity of this fact when `keys` are the table's key fields.
    /// `None` keys the fact by its full content.
    pub fn id(&self, keys: Option<&[String]>) -> FactId {
        match keys {
            Some(keys) => FactId::for_fields(self, keys),
            None => FactId::of_content(self),
        }
    }

    /// Consumes the fact, returning its field map.
    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }
}

impl From<BTreeMap<String, Value>> for Fact {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fact {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

/// Builds a [`Fact`] from `field => value` pairs.
///
/// ```rust
/// use cairn_core::{fact, Value};
///
/// let amy = fact! { "name" => "Amy", "age" => 30 };
/// assert_eq!(amy.get("age"), Some(&Value::Int64(30)));
/// ```
#[macro_export]
macro_rules! fact {
    () => {
        $crate::Fact::new()
    };
    ($($field:expr => $value:expr),+ $(,)?) => {
        $crate::Fact::new()$(.with($field, $value))+
    };
}

/// 128-bit structural identity of a fact within a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FactId(u128);

impl FactId {
    /// Digest of the `(name, value)` pairs of `keys`, in sorted name order.
    /// Missing fields encode as Null.
    pub fn for_fields(fact: &Fact, keys: &[String]) -> Self {
        let mut names: Vec<&str> = keys.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();

        let mut hasher = blake3::Hasher::new();
        for name in names {
            write_name(&mut hasher, name);
            fact.get(name).unwrap_or(&Value::Null).write_canonical(&mut hasher);
        }
        Self::finish(hasher)
    }

    /// Digest over every field of the fact.
    pub fn of_content(fact: &Fact) -> Self {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in fact.iter() {
            write_name(&mut hasher, name);
            value.write_canonical(&mut hasher);
        }
        Self::finish(hasher)
    }

    /// Raw 128-bit value.
    #[inline]
    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// Creates an id from a raw value.
    #[inline]
    pub const fn from_u128(raw: u128) -> Self {
        Self(raw)
    }

    fn finish(hasher: blake3::Hasher) -> Self {
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        Self(u128::from_le_bytes(bytes))
    }
}

fn write_name(hasher: &mut blake3::Hasher, name: &str) {
    hasher.update(&(name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
