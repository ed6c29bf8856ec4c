//! Error types for graph construction and execution
//!
//! All failures surface through [`EngineError`]. Construction problems
//! (`GraphInvalid`) are raised synchronously when a [`Graph`](crate::Graph) is
//! built and never during a run. Node-level failures (`Timeout`, `UserError`,
//! `InvalidOutput`) are produced by the node runner after retries are
//! exhausted; whether they terminate the run depends on the engine's
//! [`ErrorPolicy`](crate::ErrorPolicy). `MergeConflict` is raised by the state
//! store only under [`MergeStrategy::Reject`](crate::MergeStrategy::Reject).
//!
//! # Examples
//!
//! ```rust
//! use graphflow::EngineError;
//!
//! let err = EngineError::graph_invalid("pipeline", "start node 'a' not found");
//! assert!(matches!(err, EngineError::GraphInvalid { .. }));
//! ```

use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// All errors produced by graph construction and execution.
///
/// The variants are the engine's wire-level taxonomy; each carries enough
/// context (node id, attempt count, stringified cause) to be reported without
/// further lookup. The enum is `Clone` so the
/// [`ExecutionResult`](crate::ExecutionResult) can both record a terminating
/// error and re-surface it from
/// [`into_final_state`](crate::ExecutionResult::into_final_state).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Graph structure validation failed at construction.
    ///
    /// Covers duplicate or empty node ids, dangling edge endpoints, an
    /// unknown start node, and an empty node set. Never raised mid-run.
    #[error("graph '{graph}' is invalid: {reason}")]
    GraphInvalid {
        /// Id of the graph being validated
        graph: String,
        /// What was wrong with the structure
        reason: String,
    },

    /// A node invocation did not complete within its configured timeout.
    ///
    /// Transient: retried up to the node's `retry_count` before becoming a
    /// terminal failure. Each timed-out invocation counts as one attempt.
    #[error("node '{node}' timed out after {attempts} attempt(s): {error}")]
    Timeout {
        /// Node whose invocation timed out
        node: String,
        /// Total attempts made, including the first
        attempts: u32,
        /// Human-readable timeout description
        error: String,
    },

    /// The user function returned an error or panicked.
    ///
    /// Transient: retried up to the node's `retry_count`.
    #[error("node '{node}' failed after {attempts} attempt(s): {error}")]
    UserError {
        /// Node whose function failed
        node: String,
        /// Total attempts made, including the first
        attempts: u32,
        /// Stringified cause from the user function
        error: String,
    },

    /// The user function returned a value that is not a mapping.
    ///
    /// A contract violation: never retried.
    #[error("node '{node}' returned a non-mapping output: {error}")]
    InvalidOutput {
        /// Node that produced the invalid output
        node: String,
        /// Description of the offending value
        error: String,
    },

    /// A write under [`MergeStrategy::Reject`](crate::MergeStrategy::Reject)
    /// targeted a key that already exists.
    ///
    /// A contract violation: never retried. The failed `apply` leaves the
    /// store untouched.
    #[error("merge conflict: key '{key}' already exists")]
    MergeConflict {
        /// State key that was already present
        key: String,
    },

    /// The run was stopped by the iteration cap rather than quiescence.
    ///
    /// Reaching the cap is a normal termination for cyclic graphs, so
    /// [`Engine::run`](crate::Engine::run) does not return this itself; it is
    /// produced by
    /// [`ExecutionResult::into_final_state`](crate::ExecutionResult::into_final_state)
    /// for callers that treat a capped run as an error.
    #[error("iteration cap of {cap} superstep(s) exceeded")]
    IterationCapExceeded {
        /// The configured `max_iterations`
        cap: usize,
    },

    /// The caller-supplied cancellation signal fired.
    #[error("execution cancelled")]
    Cancelled,
}

impl EngineError {
    /// Create a graph validation error.
    pub fn graph_invalid(graph: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GraphInvalid {
            graph: graph.into(),
            reason: reason.into(),
        }
    }

    /// Create a user-function failure with node context.
    pub fn user_error(node: impl Into<String>, attempts: u32, error: impl Into<String>) -> Self {
        Self::UserError {
            node: node.into(),
            attempts,
            error: error.into(),
        }
    }

    /// Create an invalid-output failure with node context.
    pub fn invalid_output(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::InvalidOutput {
            node: node.into(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = EngineError::graph_invalid("g", "duplicate node id 'a'");
        assert_eq!(err.to_string(), "graph 'g' is invalid: duplicate node id 'a'");

        let err = EngineError::user_error("worker", 3, "boom");
        assert_eq!(err.to_string(), "node 'worker' failed after 3 attempt(s): boom");
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err = EngineError::MergeConflict { key: "result".into() };
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
