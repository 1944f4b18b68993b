//! Cairn Database - the public API of the Cairn incremental engine.
//!
//! This crate ties the store and the view compiler together:
//!
//! - `Indexer`: schema, reads, view registration and the `apply_diff` scheduler
//! - `IndexerConfig`: execution mode and round limit
//! - `ApplyReport`: the real base delta, per-view changes and diagnostics
//! - `Snapshot`: bulk export and import of base tables
//!
//! # Example
//!
//! ```rust
//! use cairn_core::fact;
//! use cairn_database::Indexer;
//! use cairn_query::{Binding, Query};
//! use cairn_storage::Changeset;
//!
//! let mut indexer = Indexer::new();
//! indexer.add_table("people", &["name"]).unwrap();
//! indexer
//!     .register_query(
//!         "adults",
//!         Query::new()
//!             .select("people", vec![], Some("p"))
//!             .calculate(">", vec![("a", Binding::field("p", "age")), ("b", Binding::value(21))], None)
//!             .project(vec![("name", Binding::field("p", "name"))]),
//!     )
//!     .unwrap();
//!
//! let mut changes = Changeset::new();
//! changes
//!     .add("people", fact! { "name" => "Amy", "age" => 30 })
//!     .add("people", fact! { "name" => "Bo", "age" => 17 });
//! indexer.apply_diff(changes).unwrap();
//!
//! assert_eq!(indexer.facts("adults").len(), 1);
//! ```

mod config;
mod indexer;
mod persistence;
mod report;
mod view;

pub use config::{ExecutionMode, IndexerConfig};
pub use indexer::Indexer;
pub use persistence::Snapshot;
pub use report::{ApplyReport, Diagnostic, ViewDelta};
pub use view::ViewDefinition;
