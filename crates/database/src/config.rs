//! Indexer configuration.

/// How views are recomputed after a change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Use delta execution wherever a plan supports it.
    #[default]
    Incremental,
    /// Recompute every affected view from scratch.
    Full,
}

/// Configuration for an [`Indexer`](crate::Indexer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexerConfig {
    /// Execution strategy for views.
    pub mode: ExecutionMode,

    /// Scheduling rounds allowed per apply before giving up.
    pub max_rounds: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Incremental,
            max_rounds: 1_000,
        }
    }
}

impl IndexerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the execution strategy.
    #[must_use]
    pub const fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the round limit.
    #[must_use]
    pub const fn max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds;
        self
    }
}
