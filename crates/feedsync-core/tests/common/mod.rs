//! Shared fixtures for integration tests
//!
//! Every test runs one logged-in engine ("alice") on a [`MemoryGraph`] and
//! plays the peers by writing straight into the graph.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use feedsync_core::store::{GraphPath, GraphStore, MemoryGraph};
use feedsync_core::{keys, listener, FeedConfig, FeedEngine, HandshakeEvent, Listener, LocalIdentity};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub const ALICE_SEED: [u8; 32] = [1u8; 32];
pub const BOB_SEED: [u8; 32] = [2u8; 32];
pub const CAROL_SEED: [u8; 32] = [3u8; 32];

pub struct Harness {
    pub graph: Arc<MemoryGraph>,
    pub engine: FeedEngine,
    pub events: broadcast::Receiver<HandshakeEvent>,
    pub alice: String,
    pub bob: LocalIdentity,
}

impl Harness {
    pub fn me(&self) -> GraphPath {
        GraphPath::user(&self.alice)
    }

    pub fn bob_pub(&self) -> String {
        self.bob.public_key().to_string()
    }

    pub async fn put(&self, path: &GraphPath, value: Value) {
        let ack = self.graph.write(path, value).await;
        assert!(ack.err.is_none(), "fixture write to {} failed", path);
    }

    /// Stored request for `recipient`, every field encrypted with alice's secret.
    pub async fn stored_request(&self, recipient: &str, address: &str, sent_req_id: &str) -> Value {
        json!({
            "recipientPub": self.engine.encrypt_for_self(recipient).await.unwrap(),
            "handshakeAddress": self.engine.encrypt_for_self(address).await.unwrap(),
            "sentReqID": self.engine.encrypt_for_self(sent_req_id).await.unwrap(),
            "timestamp": 1_000,
        })
    }

    /// Handshake request answered with `feed_id` under the alice/bob secret.
    pub async fn answered_request(&self, feed_id: &str) -> Value {
        json!({
            "response": self.engine.encrypt_for_peer(&self.bob_pub(), feed_id).await.unwrap(),
            "from": self.alice,
            "timestamp": 1_000,
        })
    }

    /// A message for the alice/bob feed pair.
    pub async fn message(&self, body: &str, timestamp: i64) -> Value {
        json!({
            "body": self.engine.encrypt_for_peer(&self.bob_pub(), body).await.unwrap(),
            "timestamp": timestamp,
        })
    }

    /// Drain every event received so far.
    pub fn drain_events(&mut self) -> Vec<HandshakeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub async fn publish_epub(graph: &MemoryGraph, identity: &LocalIdentity) {
    let path = GraphPath::user(identity.public_key()).child(keys::EPUB);
    graph
        .write(&path, json!(identity.encryption_key().as_str()))
        .await;
}

pub async fn harness() -> Harness {
    harness_with(FeedConfig::default()).await
}

pub async fn harness_with(config: FeedConfig) -> Harness {
    let graph = Arc::new(MemoryGraph::new());
    let bob = LocalIdentity::from_seed(&BOB_SEED);
    publish_epub(&graph, &bob).await;

    let engine = FeedEngine::new(graph.clone(), config).unwrap();
    let events = engine.subscribe_events();
    let identity = LocalIdentity::from_seed(&ALICE_SEED);
    let alice = identity.public_key().to_string();
    engine.login(identity).await.unwrap();

    Harness {
        graph,
        engine,
        events,
        alice,
        bob,
    }
}

/// A listener recording every snapshot it receives.
pub fn collect<T>() -> (Listener<T>, Arc<Mutex<Vec<T>>>)
where
    T: Clone + Send + Sync + 'static,
{
    let seen: Arc<Mutex<Vec<T>>> = Arc::default();
    let sink = seen.clone();
    (listener(move |value: &T| sink.lock().push(value.clone())), seen)
}

/// Let every pending window and backoff elapse.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(5)).await;
}
