//! Per-superstep message inboxes and inbox folding.
//!
//! A message is a node's full output mapping. The scheduler keeps two inbox
//! maps per superstep — the current one it reads from and the next one it
//! routes into — and swaps them atomically at the superstep boundary. Before a
//! node runs, its inbox is folded left-to-right under `MERGE` semantics into a
//! single inputs mapping.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::graph::NodeId;
use crate::state::merge_values;

/// A message routed along an edge: the emitting node's full output mapping.
pub type Message = Map<String, Value>;

/// Fold an inbox into a single inputs mapping.
///
/// Messages are merged left-to-right in arrival order using the same algebra
/// as [`MergeStrategy::Merge`](crate::MergeStrategy::Merge): nested mappings
/// merge key-wise, lists concatenate, scalars are overwritten by later
/// messages.
pub fn fold_inbox(messages: &[Message]) -> Message {
    let mut folded = Message::new();
    for message in messages {
        for (key, value) in message {
            let merged = match folded.remove(key) {
                Some(existing) => merge_values(existing, value.clone()),
                None => value.clone(),
            };
            folded.insert(key.clone(), merged);
        }
    }
    folded
}

/// Message queues for one superstep, keyed by target node.
#[derive(Debug, Default)]
pub struct InboxMap {
    inboxes: HashMap<NodeId, Vec<Message>>,
}

impl InboxMap {
    /// Create an empty inbox map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to a node's inbox, preserving arrival order.
    pub fn deliver(&mut self, target: &str, message: Message) {
        self.inboxes.entry(target.to_string()).or_default().push(message);
    }

    /// Remove and return a node's inbox for this superstep.
    pub fn take(&mut self, node: &str) -> Vec<Message> {
        self.inboxes.remove(node).unwrap_or_default()
    }

    /// Nodes with a non-empty inbox, sorted for stable iteration.
    pub fn active(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .inboxes
            .iter()
            .filter(|(_, messages)| !messages.is_empty())
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Whether no node has pending messages.
    pub fn is_quiescent(&self) -> bool {
        self.inboxes.values().all(Vec::is_empty)
    }

    /// Total number of pending messages.
    pub fn message_count(&self) -> usize {
        self.inboxes.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(value: Value) -> Message {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_deliver_preserves_arrival_order() {
        let mut inboxes = InboxMap::new();
        inboxes.deliver("agg", msg(json!({"n": 1})));
        inboxes.deliver("agg", msg(json!({"n": 2})));

        let messages = inboxes.take("agg");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["n"], json!(1));
        assert_eq!(messages[1]["n"], json!(2));

        // Taking consumes the inbox.
        assert!(inboxes.take("agg").is_empty());
    }

    #[test]
    fn test_active_is_sorted() {
        let mut inboxes = InboxMap::new();
        inboxes.deliver("zeta", msg(json!({})));
        inboxes.deliver("alpha", msg(json!({})));

        assert_eq!(inboxes.active(), vec!["alpha".to_string(), "zeta".to_string()]);
        assert!(!inboxes.is_quiescent());
        assert_eq!(inboxes.message_count(), 2);
    }

    #[test]
    fn test_fold_merges_disjoint_keys() {
        let folded = fold_inbox(&[msg(json!({"a": 20})), msg(json!({"b": 30}))]);
        assert_eq!(folded["a"], json!(20));
        assert_eq!(folded["b"], json!(30));
    }

    #[test]
    fn test_fold_later_scalar_wins_and_lists_concatenate() {
        let folded = fold_inbox(&[
            msg(json!({"v": 1, "log": ["a"]})),
            msg(json!({"v": 2, "log": ["b"]})),
        ]);
        assert_eq!(folded["v"], json!(2));
        assert_eq!(folded["log"], json!(["a", "b"]));
    }

    #[test]
    fn test_fold_empty_inbox_is_empty() {
        assert!(fold_inbox(&[]).is_empty());
    }
}
