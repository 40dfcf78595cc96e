//! In-process graph store
//!
//! [`MemoryGraph`] keeps the whole graph as one nested JSON tree behind a
//! `parking_lot::RwLock` and pushes notifications to subscribers on every
//! write. It has no replication of its own; it exists so the reconciliation
//! layer can run against a real [`GraphStore`] in tests and in embedders that
//! bridge another store into it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::trace;

use super::{AckError, ChildEvent, ChildReceiver, FieldReceiver, GraphPath, GraphStore, WriteAck};
use crate::error::FeedResult;

struct MemoryGraphInner {
    root: Value,
    field_subs: Vec<(GraphPath, mpsc::UnboundedSender<Option<Value>>)>,
    child_subs: Vec<(GraphPath, mpsc::UnboundedSender<ChildEvent>)>,
    /// Writes to these exact paths are rejected with the given error
    ack_errors: HashMap<GraphPath, AckError>,
    /// Successfully applied writes, in order
    writes: Vec<(GraphPath, Value)>,
}

/// In-memory [`GraphStore`] with write-failure injection and a write log.
///
/// # Example
///
/// ```
/// use feedsync_core::store::{GraphPath, GraphStore, MemoryGraph};
/// use serde_json::json;
///
/// # tokio_test_block_on(async {
/// let graph = MemoryGraph::new();
/// let path = GraphPath::user("me").child("seedBackup");
///
/// graph.write(&path, json!("ciphertext")).await;
/// assert_eq!(graph.read(&path).await.unwrap(), Some(json!("ciphertext")));
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct MemoryGraph {
    inner: RwLock<MemoryGraphInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryGraphInner {
                root: Value::Object(Map::new()),
                field_subs: Vec::new(),
                child_subs: Vec::new(),
                ack_errors: HashMap::new(),
                writes: Vec::new(),
            }),
        }
    }

    /// Reject every future write to exactly `path` with `err`.
    pub fn inject_ack_error(&self, path: &GraphPath, err: AckError) {
        self.inner.write().ack_errors.insert(path.clone(), err);
    }

    /// Stop rejecting writes to `path`.
    pub fn clear_ack_error(&self, path: &GraphPath) {
        self.inner.write().ack_errors.remove(path);
    }

    /// All successfully applied writes, oldest first.
    pub fn writes(&self) -> Vec<(GraphPath, Value)> {
        self.inner.read().writes.clone()
    }

    /// Applied writes whose path is exactly `path`.
    pub fn writes_to(&self, path: &GraphPath) -> Vec<Value> {
        self.inner
            .read()
            .writes
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Number of live field and child subscriptions on `path`.
    pub fn subscriber_count(&self, path: &GraphPath) -> usize {
        let inner = self.inner.read();
        let fields = inner
            .field_subs
            .iter()
            .filter(|(p, tx)| p == path && !tx.is_closed())
            .count();
        let children = inner
            .child_subs
            .iter()
            .filter(|(p, tx)| p == path && !tx.is_closed())
            .count();
        fields + children
    }

    /// Synchronous read of the current value.
    pub fn get(&self, path: &GraphPath) -> Option<Value> {
        lookup(&self.inner.read().root, path.segments()).cloned()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn read(&self, path: &GraphPath) -> FeedResult<Option<Value>> {
        Ok(self.get(path))
    }

    fn subscribe_field(&self, path: &GraphPath) -> FieldReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write();
        if let Some(current) = lookup(&inner.root, path.segments()) {
            let _ = tx.send(Some(current.clone()));
        }
        inner.field_subs.push((path.clone(), tx));
        rx
    }

    fn subscribe_children(&self, path: &GraphPath) -> ChildReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write();
        if let Some(Value::Object(children)) = lookup(&inner.root, path.segments()) {
            for (key, value) in children {
                let _ = tx.send(ChildEvent {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        inner.child_subs.push((path.clone(), tx));
        rx
    }

    async fn write(&self, path: &GraphPath, value: Value) -> WriteAck {
        let mut inner = self.inner.write();

        if let Some(err) = inner.ack_errors.get(path) {
            return WriteAck::error(err.clone());
        }

        if path.is_empty() && !value.is_object() {
            return WriteAck::error(AckError::Message(
                "the graph root only accepts objects".to_string(),
            ));
        }

        trace!(%path, "Applying write");
        apply(&mut inner.root, path.segments(), value.clone());
        inner.writes.push((path.clone(), value.clone()));

        let MemoryGraphInner {
            root,
            field_subs,
            child_subs,
            ..
        } = &mut *inner;

        field_subs.retain(|(_, tx)| !tx.is_closed());
        for (sub_path, tx) in field_subs.iter() {
            let affected = if sub_path.is_prefix_of(path) {
                true
            } else if path.is_prefix_of(sub_path) {
                lookup(&value, &sub_path.segments()[path.len()..]).is_some()
            } else {
                false
            };
            if affected {
                let _ = tx.send(lookup(root, sub_path.segments()).cloned());
            }
        }

        child_subs.retain(|(_, tx)| !tx.is_closed());
        for (sub_path, tx) in child_subs.iter() {
            if sub_path.is_prefix_of(path) && path.len() > sub_path.len() {
                let key = path.segments()[sub_path.len()].clone();
                let child = sub_path.child(key.clone());
                let current = lookup(root, child.segments()).cloned().unwrap_or(Value::Null);
                let _ = tx.send(ChildEvent {
                    key,
                    value: current,
                });
            } else if path.is_prefix_of(sub_path) {
                let written = lookup(&value, &sub_path.segments()[path.len()..]);
                if let Some(Value::Object(keys)) = written {
                    for key in keys.keys() {
                        let child = sub_path.child(key.clone());
                        let current =
                            lookup(root, child.segments()).cloned().unwrap_or(Value::Null);
                        let _ = tx.send(ChildEvent {
                            key: key.clone(),
                            value: current,
                        });
                    }
                }
            }
        }

        WriteAck::ok()
    }
}

fn lookup<'a>(mut node: &'a Value, segments: &[String]) -> Option<&'a Value> {
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

fn apply(node: &mut Value, segments: &[String], value: Value) {
    match segments.split_first() {
        None => merge(node, value),
        Some((head, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(head.clone()).or_insert(Value::Null);
                if rest.is_empty() {
                    merge(child, value);
                } else {
                    apply(child, rest, value);
                }
            }
        }
    }
}

/// Objects merge key by key; anything else replaces.
fn merge(target: &mut Value, value: Value) {
    match (target, value) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, incoming_value) in incoming {
                let slot = existing.entry(key).or_insert(Value::Null);
                merge(slot, incoming_value);
            }
        }
        (target, value) => *target = value,
    }
}
