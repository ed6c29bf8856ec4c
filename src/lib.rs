//! # graphflow - Pregel-style execution of user-defined computation graphs
//!
//! `graphflow` executes directed graphs whose vertices are arbitrary user
//! functions and whose edges carry data and control flow. Execution follows
//! the Bulk Synchronous Parallel model of Google's Pregel: it proceeds in
//! discrete **supersteps**, in each of which every node that received
//! messages runs exactly once, in parallel with its peers, and then emits
//! messages to downstream neighbors via edges that may be conditional. A
//! shared state store accumulates outputs with explicit merge semantics.
//!
//! ## Core concepts
//!
//! - **Node**: an opaque user function `(inputs, context) -> mapping`, plus
//!   per-node timeout/retry configuration. Async and blocking functions are
//!   both supported; blocking work runs on a dedicated worker pool.
//! - **Edge**: a directed connection, optionally guarded by a pure predicate
//!   over `(outputs, state)`. Cycles and self-edges are allowed.
//! - **Superstep**: one barrier-synchronized scheduler iteration — all active
//!   nodes run, then all messages are routed.
//! - **Inbox fold**: the messages a node received are folded left-to-right
//!   under `MERGE` semantics into a single inputs mapping, so a node runs at
//!   most once per superstep no matter how many edges converge on it.
//! - **State store**: a thread-safe key/value map with per-key
//!   [`MergeStrategy`] overrides; nodes and predicates see immutable
//!   snapshots only.
//! - **Termination**: quiescence (no pending messages), the iteration cap,
//!   or a fatal error — exactly one per run.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use graphflow::{Edge, Engine, EngineConfig, Graph, Node};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), graphflow::EngineError> {
//!     let inc = Node::blocking("inc", |inputs, _ctx| {
//!         let v = inputs.get("v").and_then(|v| v.as_i64()).unwrap_or(0);
//!         Ok(json!({ "v": v + 1 }))
//!     });
//!     let double = Node::blocking("double", |inputs, _ctx| {
//!         let v = inputs.get("v").and_then(|v| v.as_i64()).unwrap_or(0);
//!         Ok(json!({ "v": v * 2 }))
//!     });
//!
//!     let graph = Graph::new(
//!         "arithmetic",
//!         vec![inc, double],
//!         vec![Edge::new("inc", "double")],
//!         "inc",
//!     )?;
//!
//!     let engine = Engine::new(graph, EngineConfig::default());
//!     let mut initial = graphflow::Message::new();
//!     initial.insert("v".to_string(), json!(1));
//!
//!     let result = engine.run(initial).await;
//!     assert_eq!(result.final_state["v"], json!(4));
//!     Ok(())
//! }
//! ```
//!
//! ## Conditional routing and cycles
//!
//! Edges may loop back; predicates over node outputs decide which path
//! fires. A self-improving loop that exits once a threshold is reached:
//!
//! ```rust,ignore
//! let edges = vec![
//!     Edge::when("gate", "improve", |out, _| out["cont"].as_bool().unwrap_or(false)),
//!     Edge::new("improve", "gate"),
//!     Edge::when("gate", "final", |out, _| !out["cont"].as_bool().unwrap_or(false)),
//! ];
//! ```
//!
//! The engine enforces `max_iterations` (default 100), so cyclic graphs
//! always terminate.
//!
//! ## Failure handling
//!
//! Node failures are typed: `Timeout` and `UserError` are transient and
//! retried with exponential backoff up to the node's `retry_count`;
//! `InvalidOutput` and `MergeConflict` are contract violations and never
//! retried. A terminal failure is routed through the engine's
//! [`ErrorPolicy`]: `Propagate` (terminate the run), `Isolate` (record and
//! continue without downstream messages; the default), or `Substitute` (emit
//! a caller-supplied fallback mapping instead).
//!
//! ## Observation
//!
//! Subscribe an [`EventObserver`] to receive workflow, superstep, node, and
//! edge-evaluation events synchronously. Observers must be non-blocking;
//! panicking observers are contained and logged.
//!
//! ## Module organization
//!
//! - [`graph`] - nodes, edges, predicates, validated graph construction
//! - [`state`] - merge strategies, the state store, snapshots
//! - [`mailbox`] - per-superstep inboxes and inbox folding
//! - [`runner`] - single-node invocation with timeout and retry
//! - [`engine`] - the superstep scheduler and engine configuration
//! - [`events`] - lifecycle events and the observer bus
//! - [`result`] - the execution result envelope
//! - [`error`] - the error taxonomy

pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod mailbox;
pub mod result;
pub mod runner;
pub mod state;

pub use engine::{Engine, EngineConfig, ErrorPolicy};
pub use error::{EngineError, Result};
pub use events::{EventBus, EventObserver, ExecutionEvent};
pub use graph::{
    key_equals, BoxError, Edge, Graph, Node, NodeConfig, NodeContext, NodeId, Predicate, UserFn,
};
pub use mailbox::{fold_inbox, InboxMap, Message};
pub use result::{ExecutionResult, NodeErrorRecord, NodeStats, Termination};
pub use runner::{BackoffPolicy, FailureKind, NodeFailure, NodeRun, NodeRunner};
pub use state::{merge_values, MergeStrategy, StateSnapshot, StateStore};
