//! Feedback pipes carrying `(suggested, observed)` pairs from step
//! consumers back to the optimizer of the loop level that produced them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use data_types::Value;
use observability_deps::tracing::warn;
use parking_lot::Mutex;

type Pair = (Vec<Value>, Value);

/// Shared registry of feedback queues, one per optimizer-backed key
/// group. Cloning shares the queues.
#[derive(Debug, Clone, Default)]
pub struct FeedbackPipes {
    pipes: Arc<Mutex<HashMap<Vec<String>, VecDeque<Pair>>>>,
}

impl FeedbackPipes {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key group so feedback for it is accepted.
    pub(crate) fn register(&self, keys: Vec<String>) {
        self.pipes.lock().entry(keys).or_default();
    }

    /// Queue feedback for a key group. Unknown groups are dropped with a
    /// warning so a misspelled name does not poison the scan.
    pub fn send(&self, keys: &[impl AsRef<str>], suggested: Vec<Value>, observed: Value) {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let mut pipes = self.pipes.lock();
        match pipes.get_mut(&keys) {
            Some(q) => q.push_back((suggested, observed)),
            None => warn!(?keys, "no feedback pipe for key group"),
        }
    }

    /// Drain all queued feedback for a key group.
    pub(crate) fn drain(&self, keys: &[String]) -> Vec<Pair> {
        let mut pipes = self.pipes.lock();
        match pipes.get_mut(keys) {
            Some(q) => q.drain(..).collect(),
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_drain() {
        let pipes = FeedbackPipes::new();
        pipes.register(vec!["x".to_string()]);
        pipes.send(&["x"], vec![Value::Int(1)], Value::Float(0.5));
        pipes.send(&["x"], vec![Value::Int(2)], Value::Float(0.25));

        let drained = pipes.drain(&["x".to_string()]);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].0, vec![Value::Int(2)]);
        assert!(pipes.drain(&["x".to_string()]).is_empty());
    }

    #[test]
    fn unknown_group_is_dropped() {
        let pipes = FeedbackPipes::new();
        pipes.send(&["nope"], vec![], Value::Null);
        assert!(pipes.drain(&["nope".to_string()]).is_empty());
    }
}
