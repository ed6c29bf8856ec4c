//! Lifecycle events and the observer bus.
//!
//! The scheduler publishes [`ExecutionEvent`]s synchronously as it works
//! through a run. Observers must be non-blocking; a panicking observer is
//! contained and logged, never stalling or terminating the run.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::graph::{panic_message, NodeId};
use crate::mailbox::Message;
use crate::runner::FailureKind;

/// A lifecycle event emitted during execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A run began.
    WorkflowStart {
        run_id: Uuid,
        graph: String,
    },
    /// A run finished, successfully or not.
    WorkflowEnd {
        run_id: Uuid,
        graph: String,
        supersteps: usize,
        duration: Duration,
    },
    /// A superstep is about to dispatch its active nodes.
    SuperstepStart {
        superstep: usize,
        active: Vec<NodeId>,
    },
    /// All node runs of a superstep completed and their effects were routed.
    SuperstepEnd {
        superstep: usize,
        completed: Vec<NodeId>,
        failed: Vec<NodeId>,
    },
    /// A node invocation is starting.
    NodeStart {
        node: NodeId,
        superstep: usize,
    },
    /// A node completed; `output` is the mapping committed to state.
    NodeEnd {
        node: NodeId,
        superstep: usize,
        attempts: u32,
        duration: Duration,
        output: Message,
    },
    /// A node failed terminally (after retries, if any).
    NodeError {
        node: NodeId,
        superstep: usize,
        kind: FailureKind,
        attempts: u32,
        error: String,
        duration: Duration,
    },
    /// An edge predicate panicked; the edge did not fire.
    EdgeEvaluationError {
        source: NodeId,
        target: NodeId,
        superstep: usize,
        error: String,
    },
}

impl ExecutionEvent {
    /// Stable name of the event variant, for observers that filter by kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::WorkflowStart { .. } => "workflow_start",
            ExecutionEvent::WorkflowEnd { .. } => "workflow_end",
            ExecutionEvent::SuperstepStart { .. } => "superstep_start",
            ExecutionEvent::SuperstepEnd { .. } => "superstep_end",
            ExecutionEvent::NodeStart { .. } => "node_start",
            ExecutionEvent::NodeEnd { .. } => "node_end",
            ExecutionEvent::NodeError { .. } => "node_error",
            ExecutionEvent::EdgeEvaluationError { .. } => "edge_evaluation_error",
        }
    }
}

/// A subscriber to execution events.
///
/// Observers receive every event and filter for the ones they care about,
/// typically by matching variants or via [`ExecutionEvent::kind`]. Delivery
/// is synchronous with the emitting scheduler, so implementations must
/// return quickly. Any `Fn(&ExecutionEvent) + Send + Sync` closure is an
/// observer.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

impl<F> EventObserver for F
where
    F: Fn(&ExecutionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ExecutionEvent) {
        self(event)
    }
}

/// Fans events out to subscribed observers, isolating their failures.
#[derive(Clone, Default)]
pub struct EventBus {
    observers: Vec<Arc<dyn EventObserver>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for all events.
    pub fn subscribe(&mut self, observer: Arc<dyn EventObserver>) {
        self.observers.push(observer);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Deliver an event to every observer, in subscription order.
    pub fn emit(&self, event: &ExecutionEvent) {
        for observer in &self.observers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| observer.on_event(event))) {
                tracing::warn!(
                    error = %panic_message(&payload),
                    "event observer panicked; continuing"
                );
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_event() -> ExecutionEvent {
        ExecutionEvent::SuperstepStart {
            superstep: 0,
            active: vec!["a".to_string()],
        }
    }

    #[test]
    fn test_emit_reaches_all_observers_in_order() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();

        for _ in 0..3 {
            let seen = seen.clone();
            bus.subscribe(Arc::new(move |_event: &ExecutionEvent| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.emit(&sample_event());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(bus.observer_count(), 3);
    }

    #[test]
    fn test_panicking_observer_does_not_poison_the_bus() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();

        bus.subscribe(Arc::new(|_event: &ExecutionEvent| {
            panic!("observer bug");
        }));
        let counter = seen.clone();
        bus.subscribe(Arc::new(move |_event: &ExecutionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(&sample_event());
        assert_eq!(seen.load(Ordering::SeqCst), 1, "later observers still run");
    }

    #[test]
    fn test_events_serialize() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "superstep_start");
        assert_eq!(json["superstep"], 0);
        assert_eq!(event.kind(), "superstep_start");
    }
}
