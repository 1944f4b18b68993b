//! Cairn Storage - Storage layer for the Cairn incremental engine.
//!
//! This crate provides the storage layer including:
//!
//! - `Table`: fact storage with identity keys and secondary index maintenance
//! - `FieldIndex`: hash index over a composite field key
//! - `TableDelta`: the real change a table went through
//! - `Changeset`: batched change requests against base tables
//! - `ProvenanceLedger`: which source facts back each derived fact
//! - `Store`: all tables plus provenance, with commit of view output
//!
//! # Example
//!
//! ```rust
//! use cairn_core::fact;
//! use cairn_storage::{Keys, Store, TableKind};
//!
//! let mut store = Store::new();
//! let people = store.create_table("people", TableKind::Base, Keys::from_fields(["name"]));
//! let delta = people.apply(vec![fact! { "name" => "Amy", "age" => 30 }], vec![]);
//! assert_eq!(delta.added(), 1);
//!
//! let amy = store.find_one("people", &fact! { "name" => "Amy" });
//! assert!(amy.is_some());
//! ```

pub mod changeset;
pub mod delta;
pub mod index;
pub mod provenance;
pub mod store;
pub mod table;

pub use changeset::{Changeset, TableDiff};
pub use delta::{merge_input, InputChanges, TableDelta};
pub use index::FieldIndex;
pub use provenance::{InstanceId, ProvenanceEdge, ProvenanceLedger, SourceRef};
pub use store::{DerivedDelta, DerivedRow, Store};
pub use table::{Keys, Table, TableKind};
