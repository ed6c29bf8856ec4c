//! Node runner: one user-function invocation with timeout and retry.

use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::graph::{panic_message, BoxError, Node, NodeContext, UserFn};
use crate::mailbox::Message;

/// Exponential backoff schedule for transient node failures.
///
/// The delay before retry `i` is `base * factor^i`, capped at `cap`, where
/// `base` is the node's `retry_delay`. Jitter multiplies the capped delay by
/// a random factor in `0.5..=1.5`; it is off by default so the documented
/// schedule holds exactly.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Whether to randomize delays.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            factor: 2.0,
            cap: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Set the backoff factor.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the maximum delay between retries.
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retrying after attempt `attempt` (0-indexed).
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        let scaled = base.mul_f64(self.factor.powi(attempt as i32));
        let capped = scaled.min(self.cap);

        if self.jitter {
            use rand::Rng;
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped.mul_f64(factor).min(self.cap)
        } else {
            capped
        }
    }
}

/// The kind of a terminal node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An invocation exceeded the node's timeout (transient, retried).
    Timeout,
    /// The user function returned an error or panicked (transient, retried).
    UserError,
    /// The user function returned a non-mapping value (contract violation).
    InvalidOutput,
    /// A state write was rejected by a `Reject` merge strategy
    /// (contract violation; raised by the scheduler, not the runner).
    MergeConflict,
}

/// A successful node run.
#[derive(Debug, Clone)]
pub struct NodeRun {
    /// The output mapping the node returned.
    pub output: Message,
    /// Invocations made, including retries.
    pub attempts: u32,
    /// Wall-clock time across all attempts, backoff included.
    pub duration: Duration,
}

/// A terminal node failure, produced after retries are exhausted.
#[derive(Debug, Clone)]
pub struct NodeFailure {
    /// The failing node.
    pub node: String,
    /// What went wrong on the last attempt.
    pub kind: FailureKind,
    /// Invocations made, including retries.
    pub attempts: u32,
    /// The typed underlying cause.
    pub error: EngineError,
    /// Wall-clock time across all attempts, backoff included.
    pub duration: Duration,
}

enum Attempt {
    Output(Value),
    TimedOut,
    Raised(String),
}

/// Invokes one user function per active node, applying the node's timeout and
/// retry config with this runner's backoff schedule.
///
/// Async functions run under `tokio::spawn` so a panicking user function
/// surfaces as a `UserError` instead of unwinding the scheduler; blocking
/// functions run on the blocking pool. A timed-out async invocation is
/// aborted; a timed-out blocking invocation cannot be interrupted and is left
/// to finish detached.
#[derive(Debug, Clone, Default)]
pub struct NodeRunner {
    backoff: BackoffPolicy,
}

impl NodeRunner {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    /// Run a node to completion or terminal failure.
    pub async fn run(
        &self,
        node: &Node,
        inputs: Message,
        ctx: NodeContext,
    ) -> Result<NodeRun, NodeFailure> {
        let started = Instant::now();
        let retries = node.config.retry_count;
        let mut last_failure: Option<(FailureKind, EngineError)> = None;

        for attempt in 0..=retries {
            let attempts = attempt + 1;

            tracing::debug!(
                node = %node.id,
                superstep = ctx.superstep,
                attempt = attempts,
                max_attempts = retries + 1,
                "invoking node"
            );

            match self.attempt(node, inputs.clone(), ctx.clone()).await {
                Attempt::Output(Value::Object(output)) => {
                    if attempt > 0 {
                        tracing::info!(node = %node.id, attempts, "node succeeded after retry");
                    }
                    return Ok(NodeRun {
                        output,
                        attempts,
                        duration: started.elapsed(),
                    });
                }
                Attempt::Output(other) => {
                    // Contract violation: not retried.
                    let error = EngineError::invalid_output(
                        &node.id,
                        format!("expected an object, got {}", value_kind(&other)),
                    );
                    return Err(NodeFailure {
                        node: node.id.clone(),
                        kind: FailureKind::InvalidOutput,
                        attempts,
                        error,
                        duration: started.elapsed(),
                    });
                }
                Attempt::TimedOut => {
                    let timeout = node.config.timeout.unwrap_or_default();
                    last_failure = Some((
                        FailureKind::Timeout,
                        EngineError::Timeout {
                            node: node.id.clone(),
                            attempts,
                            error: format!("exceeded {timeout:?}"),
                        },
                    ));
                }
                Attempt::Raised(message) => {
                    last_failure = Some((
                        FailureKind::UserError,
                        EngineError::user_error(&node.id, attempts, message),
                    ));
                }
            }

            if attempt < retries {
                let delay = self.backoff.delay(node.config.retry_delay, attempt);
                tracing::warn!(
                    node = %node.id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "node attempt failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }

        // Every non-returning loop arm records a failure first.
        let (kind, error) = last_failure.unwrap_or_else(|| {
            (
                FailureKind::UserError,
                EngineError::user_error(&node.id, retries + 1, "no attempt recorded"),
            )
        });

        tracing::error!(
            node = %node.id,
            attempts = retries + 1,
            error = %error,
            "node failed after all attempts"
        );

        Err(NodeFailure {
            node: node.id.clone(),
            kind,
            attempts: retries + 1,
            error,
            duration: started.elapsed(),
        })
    }

    async fn attempt(&self, node: &Node, inputs: Message, ctx: NodeContext) -> Attempt {
        let mut handle: JoinHandle<Result<Value, BoxError>> = match &node.func {
            UserFn::Async(func) => tokio::spawn(func(inputs, ctx)),
            UserFn::Blocking(func) => {
                let func = func.clone();
                tokio::task::spawn_blocking(move || func(inputs, ctx))
            }
        };

        let joined = match node.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Cooperative cancellation; a no-op for blocking work
                    // that has already started.
                    handle.abort();
                    return Attempt::TimedOut;
                }
            },
            None => (&mut handle).await,
        };

        match joined {
            Ok(Ok(value)) => Attempt::Output(value),
            Ok(Err(error)) => Attempt::Raised(error.to_string()),
            Err(join_error) => {
                if join_error.is_panic() {
                    Attempt::Raised(panic_message(&join_error.into_panic()))
                } else {
                    Attempt::Raised("node task was aborted".to_string())
                }
            }
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeConfig;
    use crate::state::StateSnapshot;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> NodeContext {
        NodeContext {
            superstep: 0,
            node_id: "test".to_string(),
            state: StateSnapshot::default(),
        }
    }

    fn fast_retry(retry_count: u32) -> NodeConfig {
        NodeConfig::default()
            .with_retries(retry_count)
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_succeeds_without_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let node = Node::blocking("ok", move |_inputs, _ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"done": true}))
        });

        let run = NodeRunner::default().run(&node, Message::new(), ctx()).await.unwrap();
        assert_eq!(run.attempts, 1);
        assert_eq!(run.output["done"], json!(true));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let node = Node::blocking("flaky", move |_inputs, _ctx| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".into())
            } else {
                Ok(json!({"ok": true}))
            }
        })
        .with_config(fast_retry(2));

        let run = NodeRunner::default().run(&node, Message::new(), ctx()).await.unwrap();
        assert_eq!(run.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let node = Node::blocking("doomed", move |_inputs, _ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err("always fails".into())
        })
        .with_config(fast_retry(1));

        let failure = NodeRunner::default()
            .run(&node, Message::new(), ctx())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::UserError);
        assert_eq!(failure.attempts, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_mapping_output_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let node = Node::blocking("bad", move |_inputs, _ctx| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(json!(42))
        })
        .with_config(fast_retry(5));

        let failure = NodeRunner::default()
            .run(&node, Message::new(), ctx())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::InvalidOutput);
        assert_eq!(failure.attempts, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "invalid output must not retry");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_attempt() {
        let node = Node::new("slow", |_inputs, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        })
        .with_config(NodeConfig::default().with_timeout(Duration::from_millis(20)));

        let failure = NodeRunner::default()
            .run(&node, Message::new(), ctx())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test]
    async fn test_panicking_function_becomes_user_error() {
        let node = Node::blocking("panics", |_inputs, _ctx| -> Result<Value, crate::graph::BoxError> {
            panic!("kaboom")
        })
        .with_config(fast_retry(0));

        let failure = NodeRunner::default()
            .run(&node, Message::new(), ctx())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::UserError);
        assert!(failure.error.to_string().contains("kaboom"));
    }

    #[test]
    fn test_backoff_schedule_doubles_and_caps() {
        let backoff = BackoffPolicy::default().with_cap(Duration::from_secs(5));
        let base = Duration::from_secs(1);

        assert_eq!(backoff.delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff.delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff.delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff.delay(base, 3), Duration::from_secs(5), "capped");
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let backoff = BackoffPolicy::default().with_jitter(true);
        let base = Duration::from_secs(2);

        for _ in 0..20 {
            let delay = backoff.delay(base, 0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(3));
        }
    }
}
