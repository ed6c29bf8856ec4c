//! State store and merge strategies
//!
//! Graph state is a flat mapping from string keys to dynamic
//! [`serde_json::Value`]s, mutated only through the [`StateStore`]. Concurrent
//! writes from nodes completing in the same superstep are serialized by the
//! store, and how a new write combines with an existing value is governed by a
//! [`MergeStrategy`] — per key when registered, otherwise a caller-supplied
//! fallback.
//!
//! # Merge semantics
//!
//! [`MergeStrategy::Merge`] dispatches on the value variant:
//!
//! - mapping ⊕ mapping → recursive key-wise merge
//! - list ⊕ list → concatenation in write order
//! - anything else (scalars, type mismatches) → the later write wins
//!
//! ```rust
//! use graphflow::state::merge_values;
//! use serde_json::json;
//!
//! let merged = merge_values(json!({"a": 1, "nested": {"x": 1}}), json!({"nested": {"y": 2}}));
//! assert_eq!(merged, json!({"a": 1, "nested": {"x": 1, "y": 2}}));
//!
//! let merged = merge_values(json!([1, 2]), json!([3]));
//! assert_eq!(merged, json!([1, 2, 3]));
//!
//! // Type mismatch falls back to overwrite, not an error.
//! let merged = merge_values(json!({"a": 1}), json!(7));
//! assert_eq!(merged, json!(7));
//! ```
//!
//! # Snapshots
//!
//! [`StateStore::snapshot`] freezes the current top-level keys into a
//! [`StateSnapshot`] that never observes later writes. Snapshots are handed to
//! user functions and edge predicates, which must treat them as read-only.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{EngineError, Result};

/// How the state store combines a new write with an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// The new value replaces the existing one.
    Overwrite,

    /// Recursive deep merge for mappings, concatenation for lists,
    /// overwrite for everything else. The engine's default.
    #[default]
    Merge,

    /// Keep the existing value if present, otherwise set the new one.
    Ignore,

    /// Fail with [`EngineError::MergeConflict`] if the key already exists.
    Reject,
}

/// Merge `update` into `current` under [`MergeStrategy::Merge`] semantics.
///
/// Pure function over values; the store and the inbox fold both delegate here
/// so that state merging and message folding share one algebra.
pub fn merge_values(current: Value, update: Value) -> Value {
    match (current, update) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (key, value) in patch {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (Value::Array(mut base), Value::Array(tail)) => {
            base.extend(tail);
            Value::Array(base)
        }
        // Scalars and type mismatches: the later write wins.
        (_, update) => update,
    }
}

/// An immutable view of the state at a point in time.
///
/// Cheap to clone (`Arc`-shared); produced by [`StateStore::snapshot`] and
/// never observes writes made after it was taken.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    data: Arc<Map<String, Value>>,
}

impl StateSnapshot {
    /// Look up a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Whether a top-level key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// The underlying mapping.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the snapshot holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    data: Map<String, Value>,
    key_strategies: HashMap<String, MergeStrategy>,
}

/// Thread-safe key/value store with per-key merge strategies.
///
/// All operations take a single internal lock, so concurrent `apply` calls
/// from nodes completing in the same superstep observe one another's effects
/// in some serializable order. The store lives for one execution and is
/// seeded from the caller's initial state.
#[derive(Debug, Default)]
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl StateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with the given initial state.
    pub fn seeded(initial: Map<String, Value>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                data: initial,
                key_strategies: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned lock means a panic elsewhere, not corrupt state data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a value by key, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().data.get(key).cloned()
    }

    /// Set a single key, overwriting any existing value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.lock().data.insert(key.into(), value);
    }

    /// Register a per-key strategy used in place of the fallback passed to
    /// [`apply`](Self::apply).
    pub fn register_key_strategy(&self, key: impl Into<String>, strategy: MergeStrategy) {
        self.lock().key_strategies.insert(key.into(), strategy);
    }

    /// Apply a batch of updates, each key under its registered strategy or
    /// the given fallback.
    ///
    /// The batch is atomic: conflicts under [`MergeStrategy::Reject`] are
    /// detected before anything is written, so a failed `apply` leaves the
    /// store untouched.
    pub fn apply(&self, updates: Map<String, Value>, fallback: MergeStrategy) -> Result<()> {
        let mut inner = self.lock();

        for key in updates.keys() {
            let strategy = inner.key_strategies.get(key).copied().unwrap_or(fallback);
            if strategy == MergeStrategy::Reject && inner.data.contains_key(key) {
                return Err(EngineError::MergeConflict { key: key.clone() });
            }
        }

        for (key, value) in updates {
            let strategy = inner.key_strategies.get(&key).copied().unwrap_or(fallback);
            match strategy {
                MergeStrategy::Overwrite | MergeStrategy::Reject => {
                    inner.data.insert(key, value);
                }
                MergeStrategy::Merge => {
                    let merged = match inner.data.remove(&key) {
                        Some(existing) => merge_values(existing, value),
                        None => value,
                    };
                    inner.data.insert(key, merged);
                }
                MergeStrategy::Ignore => {
                    inner.data.entry(key).or_insert(value);
                }
            }
        }

        Ok(())
    }

    /// Freeze the current state into an immutable [`StateSnapshot`].
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            data: Arc::new(self.lock().data.clone()),
        }
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    /// Consume the store, returning the final state mapping.
    pub fn into_map(self) -> Map<String, Value> {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_merge_objects_recursively() {
        let merged = merge_values(
            json!({"a": {"x": 1, "y": 1}, "b": 1}),
            json!({"a": {"y": 2, "z": 3}}),
        );
        assert_eq!(merged, json!({"a": {"x": 1, "y": 2, "z": 3}, "b": 1}));
    }

    #[test]
    fn test_merge_lists_concatenate_in_write_order() {
        let merged = merge_values(json!(["a"]), json!(["b", "c"]));
        assert_eq!(merged, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_merge_type_mismatch_overwrites() {
        assert_eq!(merge_values(json!({"a": 1}), json!(5)), json!(5));
        assert_eq!(merge_values(json!([1]), json!({"a": 1})), json!({"a": 1}));
        assert_eq!(merge_values(json!("old"), json!("new")), json!("new"));
    }

    #[test]
    fn test_apply_overwrite_and_ignore() {
        let store = StateStore::seeded(map(json!({"k": 1})));

        store.apply(map(json!({"k": 2})), MergeStrategy::Overwrite).unwrap();
        assert_eq!(store.get("k"), Some(json!(2)));

        store.apply(map(json!({"k": 3, "fresh": 9})), MergeStrategy::Ignore).unwrap();
        assert_eq!(store.get("k"), Some(json!(2)));
        assert_eq!(store.get("fresh"), Some(json!(9)));
    }

    #[test]
    fn test_apply_reject_is_atomic() {
        let store = StateStore::seeded(map(json!({"existing": 1})));

        let err = store
            .apply(map(json!({"new": 2, "existing": 3})), MergeStrategy::Reject)
            .unwrap_err();
        assert!(matches!(err, EngineError::MergeConflict { ref key } if key == "existing"));

        // Nothing from the failed batch landed.
        assert_eq!(store.get("new"), None);
        assert_eq!(store.get("existing"), Some(json!(1)));
    }

    #[test]
    fn test_per_key_strategy_overrides_fallback() {
        let store = StateStore::seeded(map(json!({"log": ["first"], "step": "a"})));
        store.register_key_strategy("step", MergeStrategy::Overwrite);

        store
            .apply(map(json!({"log": ["second"], "step": "b"})), MergeStrategy::Merge)
            .unwrap();

        assert_eq!(store.get("log"), Some(json!(["first", "second"])));
        assert_eq!(store.get("step"), Some(json!("b")));
    }

    #[test]
    fn test_snapshot_does_not_observe_later_writes() {
        let store = StateStore::seeded(map(json!({"v": 1})));
        let snapshot = store.snapshot();

        store.set("v", json!(2));
        store.set("added", json!(true));

        assert_eq!(snapshot.get("v"), Some(&json!(1)));
        assert!(!snapshot.contains_key("added"));
        assert_eq!(store.get("v"), Some(json!(2)));
    }
}
