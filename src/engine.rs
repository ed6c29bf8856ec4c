//! The superstep scheduler (Pregel loop).
//!
//! Execution proceeds in discrete supersteps. In each one the engine:
//!
//! 1. Computes the active set — every node with a non-empty inbox. An empty
//!    active set terminates the run (quiescence); reaching `max_iterations`
//!    terminates it (iteration cap).
//! 2. Folds each active node's inbox into one inputs mapping and dispatches
//!    all active nodes in parallel on a bounded worker pool.
//! 3. Awaits the barrier, then for each successful node writes its output to
//!    the state store under the effective merge strategy and evaluates its
//!    outgoing edges in construction order, enqueuing the output into the
//!    next superstep's inboxes for every edge that fires.
//! 4. Routes failures through the error policy ladder, swaps the inbox maps,
//!    and loops.
//!
//! Within a superstep nodes run concurrently with no ordering guarantees;
//! between supersteps every committed effect of superstep N is visible to
//! superstep N+1. The engine owns its own state store and event bus, so any
//! number of engines can run in one process without interference.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{EventBus, EventObserver, ExecutionEvent};
use crate::graph::{Graph, Node, NodeContext, NodeId};
use crate::mailbox::{fold_inbox, InboxMap, Message};
use crate::result::{ExecutionResult, NodeErrorRecord, NodeStats, Termination};
use crate::runner::{BackoffPolicy, FailureKind, NodeFailure, NodeRun, NodeRunner};
use crate::state::{MergeStrategy, StateStore};

/// What to do with a node whose failure is terminal (retries exhausted, or a
/// contract violation).
#[derive(Debug, Clone, Default)]
pub enum ErrorPolicy {
    /// Convert the failure into a fatal error and terminate the run.
    Propagate,
    /// Record the failure and continue; the node emits no downstream
    /// messages. The default.
    #[default]
    Isolate,
    /// Replace the node's output with the given fallback mapping, which is
    /// written to state and routed like a normal output.
    Substitute(Message),
}

/// Engine configuration.
///
/// All options have defaults; builder-style setters allow picking off the
/// ones that matter.
#[derive(Clone)]
pub struct EngineConfig {
    /// Upper bound on supersteps. Default 100.
    pub max_iterations: usize,
    /// Parallelism bound for node runs. Default: number of cores.
    pub worker_pool_size: usize,
    /// Fallback strategy for state writes. Default [`MergeStrategy::Merge`].
    pub default_merge_strategy: MergeStrategy,
    /// Per-key strategy overrides, registered with the store at run start.
    pub per_key_strategies: HashMap<String, MergeStrategy>,
    /// Retry backoff schedule (factor, cap, jitter).
    pub backoff: BackoffPolicy,
    /// Engine-wide terminal-failure policy. Default [`ErrorPolicy::Isolate`].
    pub error_policy: ErrorPolicy,
    /// Per-node overrides of `error_policy`.
    pub node_error_policies: HashMap<NodeId, ErrorPolicy>,
    /// Observer subscribed at engine construction; more can be added with
    /// [`Engine::subscribe`].
    pub observer: Option<Arc<dyn EventObserver>>,
    /// Caller-provided cancellation token; a fresh one is created if absent.
    pub cancellation: Option<CancellationToken>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            worker_pool_size: num_cpus::get(),
            default_merge_strategy: MergeStrategy::Merge,
            per_key_strategies: HashMap::new(),
            backoff: BackoffPolicy::default(),
            error_policy: ErrorPolicy::default(),
            node_error_policies: HashMap::new(),
            observer: None,
            cancellation: None,
        }
    }
}

impl EngineConfig {
    /// Create a config with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the superstep upper bound.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the worker pool size.
    pub fn with_worker_pool_size(mut self, worker_pool_size: usize) -> Self {
        self.worker_pool_size = worker_pool_size;
        self
    }

    /// Set the fallback merge strategy for state writes.
    pub fn with_default_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.default_merge_strategy = strategy;
        self
    }

    /// Register a per-key merge strategy override.
    pub fn with_key_strategy(mut self, key: impl Into<String>, strategy: MergeStrategy) -> Self {
        self.per_key_strategies.insert(key.into(), strategy);
        self
    }

    /// Replace the backoff schedule.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cap the delay between retries.
    pub fn with_retry_backoff_cap(mut self, cap: std::time::Duration) -> Self {
        self.backoff.cap = cap;
        self
    }

    /// Set the engine-wide terminal-failure policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Override the terminal-failure policy for one node.
    pub fn with_node_error_policy(mut self, node: impl Into<NodeId>, policy: ErrorPolicy) -> Self {
        self.node_error_policies.insert(node.into(), policy);
        self
    }

    /// Subscribe an observer at construction.
    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Provide a cancellation token the caller controls.
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("max_iterations", &self.max_iterations)
            .field("worker_pool_size", &self.worker_pool_size)
            .field("default_merge_strategy", &self.default_merge_strategy)
            .field("per_key_strategies", &self.per_key_strategies)
            .field("backoff", &self.backoff)
            .field("error_policy", &self.error_policy)
            .field("node_error_policies", &self.node_error_policies)
            .field("observer", &self.observer.as_ref().map(|_| "<observer>"))
            .field("cancellation", &self.cancellation.is_some())
            .finish()
    }
}

enum NodeOutcome {
    Completed { node: NodeId, run: NodeRun },
    Failed(NodeFailure),
    Cancelled,
}

/// Executes a validated [`Graph`] under an [`EngineConfig`].
///
/// The engine is reusable: each call to [`run`](Self::run) owns a fresh state
/// store seeded from its initial state.
#[derive(Debug)]
pub struct Engine {
    graph: Arc<Graph>,
    config: EngineConfig,
    runner: NodeRunner,
    bus: EventBus,
    cancellation: CancellationToken,
}

impl Engine {
    /// Create an engine for a validated graph.
    pub fn new(graph: Graph, config: EngineConfig) -> Self {
        let mut bus = EventBus::new();
        if let Some(observer) = config.observer.clone() {
            bus.subscribe(observer);
        }
        let cancellation = config.cancellation.clone().unwrap_or_default();
        let runner = NodeRunner::new(config.backoff.clone());

        Self {
            graph: Arc::new(graph),
            config,
            runner,
            bus,
            cancellation,
        }
    }

    /// Subscribe an additional event observer.
    pub fn subscribe(&mut self, observer: Arc<dyn EventObserver>) {
        self.bus.subscribe(observer);
    }

    /// A handle to the engine's cancellation token; cancelling it stops the
    /// run as described in [`run`](Self::run).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// The graph this engine executes.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Execute the graph from the given initial state.
    ///
    /// The state store is seeded with `initial_state`, and the same mapping
    /// is delivered to the start node as its first message. Always returns an
    /// [`ExecutionResult`]; on fatal failure or cancellation the partial
    /// state is returned with `terminated_by = FatalError` and the cause in
    /// [`ExecutionResult::error`].
    ///
    /// After the cancellation token fires, no new node invocation begins;
    /// in-flight async invocations are cancelled cooperatively and the run
    /// returns with a [`EngineError::Cancelled`] sentinel.
    pub async fn run(&self, initial_state: Message) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        let store = StateStore::seeded(initial_state.clone());
        for (key, strategy) in &self.config.per_key_strategies {
            store.register_key_strategy(key.clone(), *strategy);
        }

        let mut current = InboxMap::new();
        current.deliver(self.graph.start(), initial_state);
        let mut next = InboxMap::new();

        let mut per_node_stats: HashMap<NodeId, NodeStats> = HashMap::new();
        let mut errors: Vec<NodeErrorRecord> = Vec::new();
        let mut messages_sent: u64 = 0;
        let mut superstep: usize = 0;

        self.bus.emit(&ExecutionEvent::WorkflowStart {
            run_id,
            graph: self.graph.id().to_string(),
        });
        tracing::info!(run_id = %run_id, graph = %self.graph.id(), "workflow started");

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));

        let (terminated_by, fatal, supersteps_executed) = loop {
            if self.cancellation.is_cancelled() {
                break (Termination::FatalError, Some(EngineError::Cancelled), superstep);
            }

            let active = current.active();
            if active.is_empty() {
                // The quiescence-detecting pass counts as a superstep.
                break (Termination::Quiescence, None, superstep + 1);
            }
            if superstep >= self.config.max_iterations {
                break (Termination::IterationCap, None, superstep);
            }

            self.bus.emit(&ExecutionEvent::SuperstepStart {
                superstep,
                active: active.clone(),
            });
            tracing::debug!(superstep, active = active.len(), "superstep started");

            // One snapshot per superstep: nodes observe only effects
            // committed at the end of earlier supersteps.
            let snapshot = store.snapshot();

            let mut dispatched = Vec::with_capacity(active.len());
            for node_id in &active {
                let messages = current.take(node_id);
                let inputs = fold_inbox(&messages);
                let Some(node) = self.graph.node(node_id) else {
                    continue; // inboxes only ever name validated nodes
                };
                let ctx = NodeContext {
                    superstep,
                    node_id: node_id.clone(),
                    state: snapshot.clone(),
                };
                dispatched.push(self.run_node(node.clone(), inputs, ctx, semaphore.clone()));
            }

            // Barrier: all active node runs complete before any routing.
            let outcomes = join_all(dispatched).await;

            let mut completed: Vec<NodeId> = Vec::new();
            let mut failures: Vec<NodeFailure> = Vec::new();

            for outcome in outcomes {
                match outcome {
                    NodeOutcome::Completed { node, run } => {
                        let stats = per_node_stats.entry(node.clone()).or_default();
                        stats.runs += u64::from(run.attempts);
                        stats.total_duration += run.duration;

                        match store.apply(run.output.clone(), self.config.default_merge_strategy) {
                            Ok(()) => {
                                messages_sent +=
                                    self.route(&node, &run.output, &store, &mut next, superstep);
                                completed.push(node);
                            }
                            Err(error) => failures.push(NodeFailure {
                                node,
                                kind: FailureKind::MergeConflict,
                                attempts: run.attempts,
                                error,
                                duration: run.duration,
                            }),
                        }
                    }
                    NodeOutcome::Failed(failure) => {
                        let stats = per_node_stats.entry(failure.node.clone()).or_default();
                        stats.runs += u64::from(failure.attempts);
                        stats.total_duration += failure.duration;
                        failures.push(failure);
                    }
                    NodeOutcome::Cancelled => {}
                }
            }

            let mut fatal: Option<EngineError> = None;
            let mut failed: Vec<NodeId> = Vec::new();

            for failure in failures {
                failed.push(failure.node.clone());
                per_node_stats.entry(failure.node.clone()).or_default().failures += 1;
                errors.push(NodeErrorRecord {
                    node: failure.node.clone(),
                    superstep,
                    kind: failure.kind,
                    attempts: failure.attempts,
                    error: failure.error.to_string(),
                    duration: failure.duration,
                    at: Utc::now(),
                });
                self.bus.emit(&ExecutionEvent::NodeError {
                    node: failure.node.clone(),
                    superstep,
                    kind: failure.kind,
                    attempts: failure.attempts,
                    error: failure.error.to_string(),
                    duration: failure.duration,
                });

                let policy = self
                    .config
                    .node_error_policies
                    .get(&failure.node)
                    .unwrap_or(&self.config.error_policy);

                match policy {
                    ErrorPolicy::Propagate => {
                        tracing::error!(
                            node = %failure.node,
                            superstep,
                            error = %failure.error,
                            "fatal node failure"
                        );
                        fatal = Some(failure.error.clone());
                        break;
                    }
                    ErrorPolicy::Isolate => {
                        tracing::warn!(
                            node = %failure.node,
                            superstep,
                            error = %failure.error,
                            "node failure isolated"
                        );
                    }
                    ErrorPolicy::Substitute(fallback) => {
                        match store.apply(fallback.clone(), self.config.default_merge_strategy) {
                            Ok(()) => {
                                messages_sent += self.route(
                                    &failure.node,
                                    fallback,
                                    &store,
                                    &mut next,
                                    superstep,
                                );
                            }
                            Err(error) => {
                                fatal = Some(error);
                                break;
                            }
                        }
                    }
                }
            }

            self.bus.emit(&ExecutionEvent::SuperstepEnd {
                superstep,
                completed,
                failed,
            });

            if fatal.is_some() {
                break (Termination::FatalError, fatal, superstep + 1);
            }

            current = std::mem::take(&mut next);
            superstep += 1;
        };

        let final_state = store.into_map();

        self.bus.emit(&ExecutionEvent::WorkflowEnd {
            run_id,
            graph: self.graph.id().to_string(),
            supersteps: supersteps_executed,
            duration: started.elapsed(),
        });
        tracing::info!(
            run_id = %run_id,
            supersteps = supersteps_executed,
            terminated = ?terminated_by,
            "workflow finished"
        );

        ExecutionResult {
            run_id,
            final_state,
            supersteps_executed,
            messages_sent,
            per_node_stats,
            errors,
            terminated_by,
            error: fatal,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_node(
        &self,
        node: Node,
        inputs: Message,
        ctx: NodeContext,
        semaphore: Arc<Semaphore>,
    ) -> NodeOutcome {
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return NodeOutcome::Cancelled, // semaphore closed
        };

        if self.cancellation.is_cancelled() {
            return NodeOutcome::Cancelled;
        }

        let superstep = ctx.superstep;
        self.bus.emit(&ExecutionEvent::NodeStart {
            node: node.id.clone(),
            superstep,
        });

        tokio::select! {
            _ = self.cancellation.cancelled() => NodeOutcome::Cancelled,
            result = self.runner.run(&node, inputs, ctx) => match result {
                Ok(run) => {
                    self.bus.emit(&ExecutionEvent::NodeEnd {
                        node: node.id.clone(),
                        superstep,
                        attempts: run.attempts,
                        duration: run.duration,
                        output: run.output.clone(),
                    });
                    NodeOutcome::Completed { node: node.id.clone(), run }
                }
                Err(failure) => NodeOutcome::Failed(failure),
            },
        }
    }

    /// Evaluate a node's outgoing edges against its output and a fresh
    /// post-write snapshot; enqueue the output for each edge that fires.
    fn route(
        &self,
        source: &NodeId,
        output: &Message,
        store: &StateStore,
        next: &mut InboxMap,
        superstep: usize,
    ) -> u64 {
        let snapshot = store.snapshot();
        let mut sent = 0;

        for edge in self.graph.outgoing(source) {
            match edge.evaluate(output, &snapshot) {
                Ok(true) => {
                    next.deliver(&edge.target, output.clone());
                    sent += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    // Predicate panicked: the edge does not fire and the
                    // failure is a warning, not a node failure.
                    tracing::warn!(
                        source = %edge.source,
                        target = %edge.target,
                        superstep,
                        error = %error,
                        "edge predicate panicked; edge does not fire"
                    );
                    self.bus.emit(&ExecutionEvent::EdgeEvaluationError {
                        source: edge.source.clone(),
                        target: edge.target.clone(),
                        superstep,
                        error,
                    });
                }
            }
        }

        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_iterations, 100);
        assert!(config.worker_pool_size >= 1);
        assert_eq!(config.default_merge_strategy, MergeStrategy::Merge);
        assert!(matches!(config.error_policy, ErrorPolicy::Isolate));
        assert!(config.observer.is_none());
        assert!(config.cancellation.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_max_iterations(10)
            .with_worker_pool_size(2)
            .with_default_merge_strategy(MergeStrategy::Overwrite)
            .with_key_strategy("log", MergeStrategy::Merge)
            .with_retry_backoff_cap(std::time::Duration::from_secs(5))
            .with_error_policy(ErrorPolicy::Propagate);

        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.default_merge_strategy, MergeStrategy::Overwrite);
        assert_eq!(config.per_key_strategies["log"], MergeStrategy::Merge);
        assert_eq!(config.backoff.cap, std::time::Duration::from_secs(5));
        assert!(matches!(config.error_policy, ErrorPolicy::Propagate));
    }
}
