//! The executable view interface shared by queries and unions.

use cairn_core::Result;
use cairn_storage::{DerivedDelta, DerivedRow, InputChanges, Store};

/// A compiled view definition.
///
/// Implementations hold no per-row state between calls; every execution reads
/// the store as it is at the time of the call.
pub trait ViewPlan {
    /// Tables the view reads.
    fn reads(&self) -> &[String];

    /// Returns true if `execute_incremental` is available.
    fn supports_incremental(&self) -> bool;

    /// Secondary indexes the view wants on the tables it reads.
    fn index_requests(&self) -> Vec<(String, Vec<String>)> {
        Vec::new()
    }

    /// Produces every row-instance of the view from scratch.
    fn execute_full(&self, store: &Store) -> Result<Vec<DerivedRow>>;

    /// Produces the row-instances added and the sources retracted by
    /// `changes`, which have already been applied to the store.
    fn execute_incremental(&self, store: &Store, changes: &InputChanges) -> Result<DerivedDelta>;
}
