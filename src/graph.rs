//! Graph data model: nodes, edges, and the validated graph
//!
//! A [`Graph`] is an immutable description of a computation: a set of
//! [`Node`]s (opaque user functions with per-node execution config), an
//! ordered sequence of directed [`Edge`]s (optionally guarded by a
//! predicate), and a start node. Structure is validated once at construction
//! and never changes during a run.
//!
//! Cycles and self-edges are permitted and supported; bounded execution is
//! the scheduler's job, not the graph's.
//!
//! # Examples
//!
//! ```rust
//! use graphflow::{Graph, Node, Edge};
//! use serde_json::json;
//!
//! let inc = Node::blocking("inc", |inputs, _ctx| {
//!     let v = inputs.get("v").and_then(|v| v.as_i64()).unwrap_or(0);
//!     Ok(json!({ "v": v + 1 }))
//! });
//! let done = Node::blocking("done", |inputs, _ctx| {
//!     let v = inputs.get("v").cloned().unwrap_or_default();
//!     Ok(json!({ "out": v }))
//! });
//!
//! let graph = Graph::new("pipeline", vec![inc, done], vec![Edge::new("inc", "done")], "inc")
//!     .unwrap();
//!
//! assert!(graph.has("inc"));
//! assert_eq!(graph.outgoing("inc").len(), 1);
//! ```

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::mailbox::Message;
use crate::state::StateSnapshot;

/// Node identifier — an opaque non-empty string, unique within a graph.
pub type NodeId = String;

/// Errors user functions may return; stringified into the failure record.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Async user function: receives the folded inputs and the node context,
/// returns the output mapping as a [`Value`] (must be an object).
pub type AsyncUserFn = Arc<
    dyn Fn(
            Message,
            NodeContext,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<Value, BoxError>> + Send>>
        + Send
        + Sync,
>;

/// Blocking user function; dispatched to the blocking worker pool so it
/// cannot stall the scheduler.
pub type BlockingUserFn =
    Arc<dyn Fn(Message, NodeContext) -> std::result::Result<Value, BoxError> + Send + Sync>;

/// Edge predicate: decides from a node's output and a state snapshot whether
/// the edge fires. Must be pure; a panicking predicate soft-fails the edge.
pub type Predicate = Arc<dyn Fn(&Message, &StateSnapshot) -> bool + Send + Sync>;

/// Execution context passed to every user-function invocation.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Zero-based index of the current superstep.
    pub superstep: usize,
    /// Id of the node being invoked.
    pub node_id: NodeId,
    /// Read-only state as of the start of this superstep.
    pub state: StateSnapshot,
}

/// Per-node execution configuration.
///
/// Defaults: no timeout, no retries, 1 s base retry delay. The delay is the
/// base for the runner's exponential backoff; the cap lives in
/// [`BackoffPolicy`](crate::BackoffPolicy).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Wall-clock limit for a single invocation; `None` means unbounded.
    pub timeout: Option<Duration>,
    /// How many times a transient failure is retried after the first attempt.
    pub retry_count: u32,
    /// Base delay between retries.
    pub retry_delay: Duration,
    /// Free-form metadata, opaque to the engine.
    pub metadata: Map<String, Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            retry_count: 0,
            retry_delay: Duration::from_secs(1),
            metadata: Map::new(),
        }
    }
}

impl NodeConfig {
    /// Set the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry count.
    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Set the base retry delay.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// The two dispatch flavors of a user function.
///
/// The engine does not assume user code is cooperative: async functions are
/// awaited on the scheduler's runtime, blocking ones run on the dedicated
/// blocking pool. Both produce the same observable superstep semantics.
#[derive(Clone)]
pub enum UserFn {
    /// Suspendable computation, awaited cooperatively.
    Async(AsyncUserFn),
    /// Blocking or CPU-bound computation, run on a worker thread.
    Blocking(BlockingUserFn),
}

/// A vertex of the computation graph: an id, a user function, and its
/// execution config.
#[derive(Clone)]
pub struct Node {
    /// Unique id within the graph.
    pub id: NodeId,
    /// The user function invoked when the node is active.
    pub func: UserFn,
    /// Timeout/retry configuration.
    pub config: NodeConfig,
}

impl Node {
    /// Create a node from an async closure.
    pub fn new<F, Fut>(id: impl Into<NodeId>, func: F) -> Self
    where
        F: Fn(Message, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            func: UserFn::Async(Arc::new(move |inputs, ctx| Box::pin(func(inputs, ctx)))),
            config: NodeConfig::default(),
        }
    }

    /// Create a node from a blocking closure.
    pub fn blocking<F>(id: impl Into<NodeId>, func: F) -> Self
    where
        F: Fn(Message, NodeContext) -> std::result::Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            func: UserFn::Blocking(Arc::new(func)),
            config: NodeConfig::default(),
        }
    }

    /// Replace the node's execution config.
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("func", &"<function>")
            .field("config", &self.config)
            .finish()
    }
}

/// A directed edge between two nodes, optionally guarded by a predicate.
///
/// An edge without a condition always fires. Multiple edges may share
/// endpoints, and self-edges are allowed.
#[derive(Clone)]
pub struct Edge {
    /// Source node id.
    pub source: NodeId,
    /// Target node id.
    pub target: NodeId,
    /// Optional firing condition over (outputs, state snapshot).
    pub condition: Option<Predicate>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    /// Create a conditional edge from a predicate closure.
    pub fn when<P>(source: impl Into<NodeId>, target: impl Into<NodeId>, predicate: P) -> Self
    where
        P: Fn(&Message, &StateSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            target: target.into(),
            condition: Some(Arc::new(predicate)),
        }
    }

    /// Evaluate whether this edge fires for the given output and state.
    ///
    /// An absent condition fires unconditionally. A panicking predicate is
    /// contained and reported as `Err` with the panic payload; the caller
    /// treats that as "does not fire" plus a warning event.
    pub fn evaluate(
        &self,
        outputs: &Message,
        state: &StateSnapshot,
    ) -> std::result::Result<bool, String> {
        match &self.condition {
            None => Ok(true),
            Some(predicate) => catch_unwind(AssertUnwindSafe(|| predicate(outputs, state)))
                .map_err(|payload| panic_message(&payload)),
        }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("condition", &self.condition.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// Extract a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

/// Build a predicate that fires when a key equals an expected value,
/// checking the node's outputs first and the state snapshot second.
pub fn key_equals(key: impl Into<String>, expected: Value) -> Predicate {
    let key = key.into();
    Arc::new(move |outputs, state| {
        outputs
            .get(&key)
            .or_else(|| state.get(&key))
            .map_or(false, |actual| *actual == expected)
    })
}

/// An immutable, validated computation graph.
#[derive(Debug)]
pub struct Graph {
    id: String,
    nodes: HashMap<NodeId, Node>,
    out_edges: HashMap<NodeId, Vec<Edge>>,
    edge_count: usize,
    start: NodeId,
    metadata: Map<String, Value>,
}

impl Graph {
    /// Build and validate a graph.
    ///
    /// Edge iteration order per source node follows the order of `edges`,
    /// which the scheduler uses for tie-breaking when routing messages.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::GraphInvalid`] on an empty node set, empty or
    /// duplicate node ids, edge endpoints that name no node, or an unknown
    /// start node. Cycles are not an error.
    pub fn new(
        id: impl Into<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        start: impl Into<NodeId>,
    ) -> Result<Self> {
        let id = id.into();
        let start = start.into();

        if nodes.is_empty() {
            return Err(EngineError::graph_invalid(&id, "graph has no nodes"));
        }

        let mut node_map: HashMap<NodeId, Node> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if node.id.is_empty() {
                return Err(EngineError::graph_invalid(&id, "node id cannot be empty"));
            }
            if node_map.contains_key(&node.id) {
                return Err(EngineError::graph_invalid(
                    &id,
                    format!("duplicate node id '{}'", node.id),
                ));
            }
            node_map.insert(node.id.clone(), node);
        }

        if !node_map.contains_key(&start) {
            return Err(EngineError::graph_invalid(
                &id,
                format!("start node '{start}' not found"),
            ));
        }

        let edge_count = edges.len();
        let mut out_edges: HashMap<NodeId, Vec<Edge>> = HashMap::new();
        for edge in edges {
            if !node_map.contains_key(&edge.source) {
                return Err(EngineError::graph_invalid(
                    &id,
                    format!("edge source '{}' not found", edge.source),
                ));
            }
            if !node_map.contains_key(&edge.target) {
                return Err(EngineError::graph_invalid(
                    &id,
                    format!("edge target '{}' not found", edge.target),
                ));
            }
            out_edges.entry(edge.source.clone()).or_default().push(edge);
        }

        Ok(Self {
            id,
            nodes: node_map,
            out_edges,
            edge_count,
            start,
            metadata: Map::new(),
        })
    }

    /// Attach graph-level metadata, opaque to the engine.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The graph id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The start node id.
    pub fn start(&self) -> &NodeId {
        &self.start
    }

    /// Graph-level metadata.
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Whether a node with this id exists.
    pub fn has(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Look up a node by id.
    pub fn node(&self, node: &str) -> Option<&Node> {
        self.nodes.get(node)
    }

    /// Outgoing edges of a node, in construction order.
    pub fn outgoing(&self, node: &str) -> &[Edge] {
        self.out_edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes (never true for a validated graph).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(id: &str) -> Node {
        Node::blocking(id, |_inputs, _ctx| Ok(json!({})))
    }

    #[test]
    fn test_valid_graph_queries() {
        let graph = Graph::new(
            "g",
            vec![noop("a"), noop("b")],
            vec![Edge::new("a", "b"), Edge::new("a", "a")],
            "a",
        )
        .unwrap();

        assert!(graph.has("a"));
        assert!(!graph.has("missing"));
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.start(), "a");

        let outgoing = graph.outgoing("a");
        assert_eq!(outgoing.len(), 2);
        assert_eq!(outgoing[0].target, "b");
        assert_eq!(outgoing[1].target, "a");
        assert!(graph.outgoing("b").is_empty());
    }

    #[test]
    fn test_rejects_empty_node_set() {
        let err = Graph::new("g", vec![], vec![], "a").unwrap_err();
        assert!(matches!(err, EngineError::GraphInvalid { .. }));
    }

    #[test]
    fn test_rejects_duplicate_node_ids() {
        let err = Graph::new("g", vec![noop("a"), noop("a")], vec![], "a").unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn test_rejects_empty_node_id() {
        let err = Graph::new("g", vec![noop("")], vec![], "").unwrap_err();
        assert!(err.to_string().contains("node id cannot be empty"));
    }

    #[test]
    fn test_rejects_dangling_edge_endpoints() {
        let err = Graph::new("g", vec![noop("a")], vec![Edge::new("a", "ghost")], "a").unwrap_err();
        assert!(err.to_string().contains("edge target 'ghost' not found"));

        let err = Graph::new("g", vec![noop("a")], vec![Edge::new("ghost", "a")], "a").unwrap_err();
        assert!(err.to_string().contains("edge source 'ghost' not found"));
    }

    #[test]
    fn test_rejects_unknown_start() {
        let err = Graph::new("g", vec![noop("a")], vec![], "ghost").unwrap_err();
        assert!(err.to_string().contains("start node 'ghost' not found"));
    }

    #[test]
    fn test_cycles_are_allowed() {
        let graph = Graph::new(
            "g",
            vec![noop("a"), noop("b")],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
            "a",
        );
        assert!(graph.is_ok());
    }

    #[test]
    fn test_unconditional_edge_always_fires() {
        let edge = Edge::new("a", "b");
        let fired = edge.evaluate(&Message::new(), &StateSnapshot::default()).unwrap();
        assert!(fired);
    }

    #[test]
    fn test_key_equals_checks_outputs_then_state() {
        let predicate = key_equals("status", json!("ok"));

        let mut outputs = Message::new();
        outputs.insert("status".to_string(), json!("ok"));
        assert!(predicate(&outputs, &StateSnapshot::default()));

        assert!(!predicate(&Message::new(), &StateSnapshot::default()));
    }

    #[test]
    fn test_panicking_predicate_is_contained() {
        let edge = Edge::when("a", "b", |_outputs, _state| panic!("bad predicate"));
        let result = edge.evaluate(&Message::new(), &StateSnapshot::default());
        assert_eq!(result.unwrap_err(), "bad predicate");
    }
}
