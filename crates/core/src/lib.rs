//! Cairn Core - Core types for the Cairn incremental relational engine.
//!
//! This crate provides the foundational types shared by every layer:
//!
//! - `Value`: scalar values stored in fact fields
//! - `Fact`: an immutable named-field tuple
//! - `FactId`: the structural identity of a fact inside a table
//! - `Error` / `CompileError`: error types for engine operations
//!
//! # Example
//!
//! ```rust
//! use cairn_core::{fact, FactId, Value};
//!
//! let amy = fact! { "name" => "Amy", "age" => 30 };
//! let keys = vec!["name".to_string()];
//!
//! let older = amy.clone().with("age", 31);
//! assert_eq!(FactId::for_fields(&amy, &keys), FactId::for_fields(&older, &keys));
//! assert_eq!(amy.get("age"), Some(&Value::Int64(30)));
//! ```

mod error;
mod fact;
mod value;

pub use error::{CompileError, Error, Result};
pub use fact::{Fact, FactId};
pub use value::Value;
