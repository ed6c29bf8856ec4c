//! Execution result envelope: final state, stats, and termination cause.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::graph::NodeId;
use crate::runner::FailureKind;

/// Why a run ended. Exactly one fires per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// No node had pending messages.
    Quiescence,
    /// The configured `max_iterations` bound was reached.
    IterationCap,
    /// A fatal node failure or cancellation stopped the run.
    FatalError,
}

/// Per-node execution statistics.
///
/// `runs` counts user-function invocations, retries included, so a node that
/// succeeded on its third attempt contributes three.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub runs: u64,
    pub failures: u64,
    pub total_duration: Duration,
}

/// A terminal node failure recorded in the result trace.
#[derive(Debug, Clone, Serialize)]
pub struct NodeErrorRecord {
    /// The failing node.
    pub node: NodeId,
    /// Superstep in which the failure occurred.
    pub superstep: usize,
    /// What went wrong.
    pub kind: FailureKind,
    /// Invocations made, retries included.
    pub attempts: u32,
    /// Stringified underlying cause.
    pub error: String,
    /// Wall-clock time spent on the node across attempts.
    pub duration: Duration,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// The outcome of one engine run.
///
/// Always returned, even on fatal failure or cancellation — `final_state`
/// then holds whatever was committed before the run stopped.
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// The state accumulated by the run.
    pub final_state: Map<String, Value>,
    /// Scheduler iterations entered, including the quiescence-detecting pass.
    pub supersteps_executed: usize,
    /// Messages routed along fired edges over the whole run.
    pub messages_sent: u64,
    /// Per-node invocation counts, failure counts, and durations.
    pub per_node_stats: HashMap<NodeId, NodeStats>,
    /// Terminal node failures, in the order they were handled.
    pub errors: Vec<NodeErrorRecord>,
    /// Why the run ended.
    pub terminated_by: Termination,
    /// The terminating error when `terminated_by` is `FatalError`.
    #[serde(skip)]
    pub error: Option<EngineError>,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end of the run.
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Stats for one node, defaulting to zeros for nodes that never ran.
    pub fn stats(&self, node: &str) -> NodeStats {
        self.per_node_stats.get(node).cloned().unwrap_or_default()
    }

    /// Total wall-clock duration of the run.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }

    /// The final state for strict callers.
    ///
    /// Quiescent runs yield their state; a capped run becomes
    /// [`EngineError::IterationCapExceeded`] and a fatal run re-surfaces its
    /// recorded error.
    pub fn into_final_state(self) -> Result<Map<String, Value>> {
        match self.terminated_by {
            Termination::Quiescence => Ok(self.final_state),
            Termination::IterationCap => Err(EngineError::IterationCapExceeded {
                cap: self.supersteps_executed,
            }),
            // The engine records the cause whenever it terminates fatally.
            Termination::FatalError => Err(self.error.unwrap_or(EngineError::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(terminated_by: Termination, error: Option<EngineError>) -> ExecutionResult {
        ExecutionResult {
            run_id: Uuid::new_v4(),
            final_state: Map::new(),
            supersteps_executed: 3,
            messages_sent: 0,
            per_node_stats: HashMap::new(),
            errors: Vec::new(),
            terminated_by,
            error,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_into_final_state_quiescence() {
        assert!(result(Termination::Quiescence, None).into_final_state().is_ok());
    }

    #[test]
    fn test_into_final_state_iteration_cap() {
        let err = result(Termination::IterationCap, None)
            .into_final_state()
            .unwrap_err();
        assert!(matches!(err, EngineError::IterationCapExceeded { cap: 3 }));
    }

    #[test]
    fn test_into_final_state_fatal_surfaces_cause() {
        let err = result(
            Termination::FatalError,
            Some(EngineError::user_error("n", 1, "boom")),
        )
        .into_final_state()
        .unwrap_err();
        assert!(matches!(err, EngineError::UserError { .. }));
    }

    #[test]
    fn test_missing_stats_default_to_zero() {
        let stats = result(Termination::Quiescence, None).stats("never-ran");
        assert_eq!(stats.runs, 0);
        assert_eq!(stats.failures, 0);
    }
}
