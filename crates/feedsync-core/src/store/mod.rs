//! Graph store seam
//!
//! The replicated graph store is an external collaborator. This module defines
//! the capability set the reconciliation layer consumes from it, plus an
//! in-process implementation ([`MemoryGraph`]).
//!
//! ## Capabilities
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  GraphStore                                                     │
//! │  ├── read(path)             current value, None if absent       │
//! │  ├── once(path)             one-shot read                       │
//! │  ├── subscribe_field(path)  every change to the subtree         │
//! │  ├── subscribe_children(p)  one event per child, then changes   │
//! │  └── write(path, value)     WriteAck { err: Option<AckError> }  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Values are `serde_json::Value`s. `None` means the path was never written;
//! `Some(Value::Null)` is a tombstone. Subscriptions are plain `mpsc`
//! receivers: dropping the receiver unsubscribes. Delivery may repeat values
//! and carries no ordering guarantees across paths.

mod memory;

pub use memory::MemoryGraph;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::FeedResult;

/// Receiver for field-level notifications (`None` = value removed/absent).
pub type FieldReceiver = mpsc::UnboundedReceiver<Option<Value>>;

/// Receiver for child-level notifications.
pub type ChildReceiver = mpsc::UnboundedReceiver<ChildEvent>;

/// A path into the graph, as a list of segments.
///
/// User-space paths start with a `~<public key>` segment, mirroring how the
/// store namespaces each identity's signed graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphPath(Vec<String>);

impl GraphPath {
    /// The public (unsigned) root of the graph.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// The signed graph of the given user.
    pub fn user(public_key: &str) -> Self {
        Self(vec![format!("~{}", public_key)])
    }

    /// Append a segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is `other` or one of its ancestors.
    pub fn is_prefix_of(&self, other: &GraphPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for GraphPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// One child notification from [`GraphStore::subscribe_children`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    /// Key of the child under the subscribed path
    pub key: String,
    /// Current value of the child (`Value::Null` for tombstones)
    pub value: Value,
}

/// Error carried by a write acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    /// Store-specific status code, usually benign
    Code(i64),
    /// A real failure
    Message(String),
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckError::Code(code) => write!(f, "code {}", code),
            AckError::Message(msg) => write!(f, "{}", msg),
        }
    }
}

/// Acknowledgment returned by [`GraphStore::write`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteAck {
    pub err: Option<AckError>,
}

impl WriteAck {
    pub fn ok() -> Self {
        Self { err: None }
    }

    pub fn error(err: AckError) -> Self {
        Self { err: Some(err) }
    }
}

/// Capability set consumed from the replicated graph store.
#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    /// Current value at `path`.
    async fn read(&self, path: &GraphPath) -> FeedResult<Option<Value>>;

    /// One-shot read. Stores that resolve lazily may wait briefly for data.
    async fn once(&self, path: &GraphPath) -> FeedResult<Option<Value>> {
        self.read(path).await
    }

    /// Subscribe to every change of the subtree rooted at `path`.
    ///
    /// The current value is delivered first when present.
    fn subscribe_field(&self, path: &GraphPath) -> FieldReceiver;

    /// Subscribe to the children of `path`.
    ///
    /// Every existing child is delivered first, then each child change.
    fn subscribe_children(&self, path: &GraphPath) -> ChildReceiver;

    /// Write `value` at `path`. Objects merge into existing objects; any other
    /// value (including null) replaces what was there.
    async fn write(&self, path: &GraphPath, value: Value) -> WriteAck;
}
