//! Error types for Cairn.

use thiserror::Error;

/// Result type alias for Cairn operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised while compiling a query or union definition.
///
/// A compile error only blocks the view it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A select stage names a table the store does not know.
    #[error("unknown table: {table}")]
    UnknownTable {
        /// Name of the missing table.
        table: String,
    },

    /// A binding names an alias that is not defined by an earlier stage.
    #[error("stage {stage} references unknown or later alias: {alias}")]
    UnknownAlias {
        /// Index of the referencing stage.
        stage: usize,
        /// The alias that could not be resolved.
        alias: String,
    },

    /// A reference has the wrong shape for the stage it points at.
    #[error("invalid reference to {alias}: {message}")]
    InvalidReference {
        /// The alias being referenced.
        alias: String,
        /// Description of the mismatch.
        message: String,
    },

    /// No function with this name is registered.
    #[error("unknown function: {name}")]
    UnknownFunction {
        /// Function name.
        name: String,
    },

    /// The function exists but cannot be used by this kind of stage.
    #[error("function {name} is a {actual}, expected a {expected}")]
    WrongFunctionKind {
        /// Function name.
        name: String,
        /// Kind the stage requires.
        expected: &'static str,
        /// Kind the function was registered as.
        actual: &'static str,
    },

    /// A declared function parameter has no binding.
    #[error("function {function} is missing argument {argument}")]
    MissingArgument {
        /// Function name.
        function: String,
        /// Parameter name.
        argument: String,
    },

    /// A binding names a parameter the function does not declare.
    #[error("function {function} has no parameter {argument}")]
    UnknownArgument {
        /// Function name.
        function: String,
        /// Offending argument name.
        argument: String,
    },

    /// The first stage of a query must be a non-negated select.
    #[error("query must start with a select stage")]
    InvalidRoot,

    /// Aggregate results may only be referenced from the projection.
    #[error("aggregate result {alias} referenced outside projection")]
    AggregateReference {
        /// Alias of the aggregate stage.
        alias: String,
    },

    /// Incremental execution was required but the pipeline does not allow it.
    #[error("query cannot run incrementally: {reason}")]
    NotIncremental {
        /// Which feature prevents incremental execution.
        reason: String,
    },

    /// A union with no members.
    #[error("union has no members")]
    EmptyUnion,

    /// Union members do not produce the same field set.
    #[error("union member {member} on {table} produces different fields")]
    MismatchedMemberFields {
        /// Position of the offending member.
        member: usize,
        /// Its source table.
        table: String,
    },
}

/// Errors that can occur in Cairn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A view definition failed to compile.
    #[error("compile error in view {view}: {source}")]
    Compile {
        /// Name of the view.
        view: String,
        /// Underlying compile error.
        #[source]
        source: CompileError,
    },

    /// Table not found.
    #[error("table not found: {name}")]
    TableNotFound {
        /// Name of the table.
        name: String,
    },

    /// View not found.
    #[error("view not found: {name}")]
    ViewNotFound {
        /// Name of the view.
        name: String,
    },

    /// A changeset or schema call tried to write a derived table.
    #[error("table {table} is derived and cannot be written directly")]
    DerivedTableWrite {
        /// Name of the derived table.
        table: String,
    },

    /// The view is still read by other views.
    #[error("view {name} is read by {dependents:?}")]
    ViewInUse {
        /// Name of the view.
        name: String,
        /// Views reading it.
        dependents: Vec<String>,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A function failed while a plan was executing.
    #[error("evaluation failed in {function}: {message}")]
    Evaluation {
        /// Function that failed.
        function: String,
        /// Description of the failure.
        message: String,
    },

    /// Recompute did not reach a fixpoint within the round limit.
    #[error("no fixpoint after {rounds} rounds, still pending: {pending:?}")]
    Diverged {
        /// Rounds executed.
        rounds: usize,
        /// Views still queued when the limit was hit.
        pending: Vec<String>,
    },

    /// Snapshot encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Creates a compile error for a view.
    pub fn compile(view: impl Into<String>, source: CompileError) -> Self {
        Error::Compile {
            view: view.into(),
            source,
        }
    }

    /// Creates a table not found error.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Error::TableNotFound { name: name.into() }
    }

    /// Creates a view not found error.
    pub fn view_not_found(name: impl Into<String>) -> Self {
        Error::ViewNotFound { name: name.into() }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an evaluation error.
    pub fn evaluation(function: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Evaluation {
            function: function.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::table_not_found("people");
        assert_eq!(err.to_string(), "table not found: people");

        let err = Error::compile(
            "adults",
            CompileError::UnknownFunction {
                name: "frobnicate".into(),
            },
        );
        assert_eq!(
            err.to_string(),
            "compile error in view adults: unknown function: frobnicate"
        );
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as _;
        let err = Error::compile("v", CompileError::InvalidRoot);
        assert!(err.source().is_some());
    }
}
