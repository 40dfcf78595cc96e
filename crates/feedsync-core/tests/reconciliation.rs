//! Reconciliation tests
//!
//! Store notifications in, decrypted snapshots out: outgoing feeds, incoming
//! feeds, chats, the handshake address, requests and the seed backup.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{collect, harness, settle, CAROL_SEED};
use feedsync_core::{
    keys, Chat, FeedConfig, FeedEngine, FeedError, GraphPath, GraphStore, IncomingMessages,
    LocalIdentity, MemoryGraph, Message, Outgoing, OutgoingMessage, Outgoings, SimpleReceivedRequest,
};
use serde_json::json;

// ============================================================================
// Outgoing feeds
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_outgoing_snapshot_is_decrypted() {
    let h = harness().await;
    let bob = h.bob_pub();

    let (seen, snapshots) = collect::<Outgoings>();
    let _sub = h.engine.on_outgoing(seen).unwrap();

    let with = h.engine.encrypt_for_self(&bob).await.unwrap();
    let message = h.message("hi", 1_000).await;
    h.put(
        &h.me().child(keys::OUTGOINGS).child("f1"),
        json!({ "with": with, "messages": { "m1": message } }),
    )
    .await;
    settle().await;

    let mut messages = BTreeMap::new();
    messages.insert(
        "m1".to_string(),
        OutgoingMessage {
            body: Some("hi".into()),
            timestamp: 1_000,
        },
    );
    let mut expected = Outgoings::new();
    expected.insert(
        "f1".to_string(),
        Some(Outgoing {
            with: bob,
            messages,
        }),
    );

    let snapshots = snapshots.lock();
    assert_eq!(snapshots.first(), Some(&Outgoings::new()));
    assert_eq!(snapshots.last(), Some(&expected));
    assert_eq!(h.engine.current_outgoings().unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_outgoing_tombstones_and_bad_entries() {
    let h = harness().await;
    let bob = h.bob_pub();

    let with = h.engine.encrypt_for_self(&bob).await.unwrap();
    let good = h.message("ok", 2).await;
    h.put(
        &h.me().child(keys::OUTGOINGS),
        json!({
            "f1": { "with": with, "messages": {
                "m1": good,
                "m2": { "body": "fs1:AAAA", "timestamp": 3 },
                "m3": "not a message",
            }},
            "f2": null,
            "f3": "not a feed",
            "f4": { "with": "garbage", "messages": {} },
        }),
    )
    .await;

    let (seen, snapshots) = collect::<Outgoings>();
    let _sub = h.engine.on_outgoing(seen).unwrap();
    settle().await;

    let last = snapshots.lock().last().cloned().unwrap();
    assert_eq!(last.keys().collect::<Vec<_>>(), vec!["f1", "f2"]);
    assert_eq!(last["f2"], None);

    let f1 = last["f1"].as_ref().unwrap();
    assert_eq!(f1.messages.len(), 2);
    assert_eq!(f1.messages["m1"].body.as_deref(), Some("ok"));
    assert_eq!(f1.messages["m2"].body, None);
}

/// A snapshot that cannot be reconciled leaves the previous one committed.
#[tokio::test(start_paused = true)]
async fn test_failed_outgoing_snapshot_keeps_previous() {
    let h = harness().await;
    let bob = h.bob_pub();

    let (seen, snapshots) = collect::<Outgoings>();
    let _sub = h.engine.on_outgoing(seen).unwrap();

    let with = h.engine.encrypt_for_self(&bob).await.unwrap();
    h.put(
        &h.me().child(keys::OUTGOINGS).child("f1"),
        json!({ "with": with, "messages": {} }),
    )
    .await;
    settle().await;
    let committed = h.engine.current_outgoings().unwrap();
    assert_eq!(committed.len(), 1);

    // Carol never published an encryption key
    let carol = LocalIdentity::from_seed(&CAROL_SEED);
    let with_carol = h.engine.encrypt_for_self(carol.public_key()).await.unwrap();
    h.put(
        &h.me().child(keys::OUTGOINGS).child("f2"),
        json!({ "with": with_carol, "messages": {} }),
    )
    .await;
    settle().await;

    assert_eq!(h.engine.current_outgoings().unwrap(), committed);
    assert_eq!(snapshots.lock().last(), Some(&committed));
}

// ============================================================================
// Incoming feeds
// ============================================================================

/// Malformed and undecryptable entries are skipped, good ones kept.
#[tokio::test(start_paused = true)]
async fn test_incoming_decryption_fault_isolation() {
    let h = harness().await;
    let bob = h.bob_pub();

    let (seen, snapshots) = collect::<IncomingMessages>();
    let _sub = h.engine.on_incoming_messages(&bob, "f9", seen).unwrap();

    let good = h.message("hello", 10).await;
    let mut bad_timestamp = h.message("late", 0).await;
    bad_timestamp["timestamp"] = json!("soon");
    h.put(
        &GraphPath::user(&bob).child(keys::OUTGOINGS).child("f9"),
        json!({ "with": "enc", "messages": {
            "m1": good,
            "m2": "garbage",
            "m3": { "body": "fs1:AAAA", "timestamp": 5 },
            "m4": bad_timestamp,
        }}),
    )
    .await;
    settle().await;

    let mut expected = IncomingMessages::new();
    expected.insert(
        "m1".to_string(),
        Message {
            body: "hello".into(),
            timestamp: 10,
        },
    );

    let snapshots = snapshots.lock();
    assert_eq!(snapshots.as_slice(), &[IncomingMessages::new(), expected]);
}

/// Entries accumulate; a later bad entry does not disturb earlier ones.
#[tokio::test(start_paused = true)]
async fn test_incoming_feed_accumulates() {
    let h = harness().await;
    let bob = h.bob_pub();
    let messages = GraphPath::user(&bob)
        .child(keys::OUTGOINGS)
        .child("f9")
        .child(keys::MESSAGES);

    let (seen, snapshots) = collect::<IncomingMessages>();
    let _sub = h.engine.on_incoming_messages(&bob, "f9", seen).unwrap();

    let first = h.message("one", 1).await;
    h.put(&messages.child("m1"), first).await;
    settle().await;

    h.put(&messages.child("m2"), json!(17)).await;
    let second = h.message("two", 2).await;
    h.put(&messages.child("m3"), second).await;
    settle().await;

    let last = snapshots.lock().last().cloned().unwrap();
    assert_eq!(last.keys().collect::<Vec<_>>(), vec!["m1", "m3"]);
    assert_eq!(last["m3"].body, "two");
}

#[tokio::test(start_paused = true)]
async fn test_user_to_incoming_index() {
    let h = harness().await;
    let bob = h.bob_pub();
    let index = h.me().child(keys::USER_TO_INCOMING);

    let (seen, snapshots) = collect::<BTreeMap<String, String>>();
    let _sub = h.engine.on_user_to_incoming(seen).unwrap();

    let feed = h.engine.encrypt_for_self("f9").await.unwrap();
    h.put(&index.child(&bob), json!(feed)).await;
    h.put(&index.child("pubEmpty"), json!("")).await;
    h.put(&index.child("pubNumber"), json!(42)).await;
    h.put(&index.child("pubGarbage"), json!("fs1:AAAA")).await;
    settle().await;

    let mut expected = BTreeMap::new();
    expected.insert(bob.clone(), "f9".to_string());
    assert_eq!(snapshots.lock().last(), Some(&expected));

    h.put(&index.child(&bob), serde_json::Value::Null).await;
    settle().await;
    assert_eq!(snapshots.lock().last(), Some(&BTreeMap::new()));
}

// ============================================================================
// Chats
// ============================================================================

/// A chat only shows up once the peer has an incoming entry.
#[tokio::test(start_paused = true)]
async fn test_chat_appears_with_incoming_feed() {
    let h = harness().await;
    let bob = h.bob_pub();

    let (seen, snapshots) = collect::<Vec<Chat>>();
    let _sub = h.engine.on_chats(seen).unwrap();

    let with = h.engine.encrypt_for_self(&bob).await.unwrap();
    let hi = h.message("hi", 1_000).await;
    h.put(
        &h.me().child(keys::OUTGOINGS).child("f1"),
        json!({ "with": with, "messages": { "m1": hi } }),
    )
    .await;
    settle().await;
    assert!(h.engine.chats().unwrap().is_empty());

    let reply = h.message("hey", 2_000).await;
    h.put(
        &GraphPath::user(&bob)
            .child(keys::OUTGOINGS)
            .child("f9")
            .child(keys::MESSAGES)
            .child("i1"),
        reply,
    )
    .await;
    let feed = h.engine.encrypt_for_self("f9").await.unwrap();
    h.put(&h.me().child(keys::USER_TO_INCOMING).child(&bob), json!(feed))
        .await;
    settle().await;

    let chats = h.engine.chats().unwrap();
    assert_eq!(chats.len(), 1);
    let chat = &chats[0];
    assert_eq!(chat.id, format!("{}f1", bob));
    assert_eq!(chat.recipient_public_key, bob);
    assert!(!chat.did_disconnect);
    let bodies: Vec<_> = chat
        .messages
        .iter()
        .map(|m| (m.body.as_str(), m.outgoing))
        .collect();
    assert_eq!(bodies, vec![("hi", true), ("hey", false)]);
    assert_eq!(snapshots.lock().last(), Some(&chats));

    // Peer disconnects
    h.put(
        &h.me().child(keys::USER_TO_INCOMING).child(&bob),
        serde_json::Value::Null,
    )
    .await;
    settle().await;

    let chats = h.engine.chats().unwrap();
    assert!(chats[0].did_disconnect);
    assert_eq!(chats[0].messages.len(), 1);
    assert!(chats[0].messages[0].outgoing);
}

/// Switching a peer to a new incoming feed detaches the old one.
#[tokio::test(start_paused = true)]
async fn test_chat_follows_replaced_incoming_feed() {
    let h = harness().await;
    let bob = h.bob_pub();
    let (seen, _) = collect::<Vec<Chat>>();
    let _sub = h.engine.on_chats(seen).unwrap();
    let bob_feed = |feed_id: &str, message_id: &str| {
        GraphPath::user(&bob)
            .child(keys::OUTGOINGS)
            .child(feed_id)
            .child(keys::MESSAGES)
            .child(message_id)
    };

    let with = h.engine.encrypt_for_self(&bob).await.unwrap();
    h.put(
        &h.me().child(keys::OUTGOINGS).child("f1"),
        json!({ "with": with, "messages": {} }),
    )
    .await;
    h.put(&bob_feed("f9", "i1"), h.message("old", 1_000).await).await;
    h.put(&bob_feed("f10", "i1"), h.message("new", 2_000).await).await;

    let index = h.me().child(keys::USER_TO_INCOMING).child(&bob);
    h.put(&index, json!(h.engine.encrypt_for_self("f9").await.unwrap()))
        .await;
    settle().await;
    h.put(&index, json!(h.engine.encrypt_for_self("f10").await.unwrap()))
        .await;
    settle().await;

    // Late traffic on the replaced feed is not picked up
    h.put(&bob_feed("f9", "i2"), h.message("late", 3_000).await).await;
    settle().await;

    let chats = h.engine.chats().unwrap();
    assert_eq!(chats.len(), 1);
    let bodies: Vec<_> = chats[0].messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["new"]);
}

/// Disconnect marker with no prior feed: outgoing messages only.
#[tokio::test(start_paused = true)]
async fn test_chat_for_disconnected_peer() {
    let h = harness().await;
    let bob = h.bob_pub();

    h.put(
        &h.me().child(keys::USER_TO_INCOMING).child(&bob),
        serde_json::Value::Null,
    )
    .await;
    let with = h.engine.encrypt_for_self(&bob).await.unwrap();
    let hi = h.message("hi", 1_000).await;
    h.put(
        &h.me().child(keys::OUTGOINGS).child("f1"),
        json!({ "with": with, "messages": { "m1": hi } }),
    )
    .await;

    let (seen, snapshots) = collect::<Vec<Chat>>();
    let _sub = h.engine.on_chats(seen).unwrap();
    settle().await;

    let chats = snapshots.lock().last().cloned().unwrap();
    assert_eq!(chats.len(), 1);
    assert!(chats[0].did_disconnect);
    assert_eq!(chats[0].messages.len(), 1);
    assert_eq!(chats[0].messages[0].body, "hi");
}

/// Both sides run their own engine on the same graph.
#[tokio::test(start_paused = true)]
async fn test_two_sessions_share_a_conversation() {
    let graph = Arc::new(MemoryGraph::new());
    let alice_id = LocalIdentity::from_seed(&common::ALICE_SEED);
    let bob_id = LocalIdentity::from_seed(&common::BOB_SEED);
    let alice_pub = alice_id.public_key().to_string();
    let bob_pub = bob_id.public_key().to_string();

    let alice = FeedEngine::new(graph.clone(), FeedConfig::default()).unwrap();
    let bob = FeedEngine::new(graph.clone(), FeedConfig::default()).unwrap();
    alice.login(alice_id).await.unwrap();
    bob.login(bob_id).await.unwrap();

    let body = bob.encrypt_for_peer(&alice_pub, "from bob").await.unwrap();
    graph
        .write(
            &GraphPath::user(&bob_pub)
                .child(keys::OUTGOINGS)
                .child("fb")
                .child(keys::MESSAGES)
                .child("b1"),
            json!({ "body": body, "timestamp": 7 }),
        )
        .await;

    let (seen, snapshots) = collect::<IncomingMessages>();
    let _sub = alice.on_incoming_messages(&bob_pub, "fb", seen).unwrap();
    settle().await;

    let last = snapshots.lock().last().cloned().unwrap();
    assert_eq!(last["b1"].body, "from bob");
}

// ============================================================================
// Address, requests, seed
// ============================================================================

/// N address changes inside one window reach a listener once.
#[tokio::test(start_paused = true)]
async fn test_address_updates_are_coalesced() {
    let h = harness().await;
    let (seen, deliveries) = collect::<Option<String>>();
    let _sub = h.engine.on_current_handshake_address(seen).unwrap();

    let path = h.me().child(keys::CURRENT_HANDSHAKE_ADDRESS);
    for i in 0..5 {
        h.put(&path, json!(format!("addr{}", i))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    settle().await;

    assert_eq!(
        deliveries.lock().as_slice(),
        &[None, Some("addr4".to_string())]
    );
    assert_eq!(
        h.engine.current_handshake_address().unwrap(),
        Some("addr4".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_non_string_address_resets() {
    let h = harness().await;
    let path = h.me().child(keys::CURRENT_HANDSHAKE_ADDRESS);
    h.put(&path, json!("addrA")).await;

    let (seen, deliveries) = collect::<Option<String>>();
    let _sub = h.engine.on_current_handshake_address(seen).unwrap();
    settle().await;
    assert_eq!(deliveries.lock().last(), Some(&Some("addrA".to_string())));

    h.put(&path, json!({ "nested": true })).await;
    settle().await;
    assert_eq!(deliveries.lock().last(), Some(&None));
}

#[tokio::test(start_paused = true)]
async fn test_received_requests_follow_address() {
    let h = harness().await;
    let bob = h.bob_pub();
    let carol = LocalIdentity::from_seed(&CAROL_SEED);
    let nodes = GraphPath::root().child(keys::HANDSHAKE_NODES);

    h.put(&h.me().child(keys::CURRENT_HANDSHAKE_ADDRESS), json!("addrA"))
        .await;
    h.put(
        &nodes.child("addrA").child("q1"),
        json!({ "response": "enc1", "from": carol.public_key(), "timestamp": 5 }),
    )
    .await;
    h.put(
        &nodes.child("addrA").child("q2"),
        json!({ "response": "enc2", "from": bob }),
    )
    .await;
    h.put(&nodes.child("addrA").child("q3"), json!({ "response": "enc3" }))
        .await;
    let feed = h.engine.encrypt_for_self("f9").await.unwrap();
    h.put(&h.me().child(keys::USER_TO_INCOMING).child(&bob), json!(feed))
        .await;

    let (seen, snapshots) = collect::<Vec<SimpleReceivedRequest>>();
    let _sub = h.engine.on_received_requests(seen).unwrap();
    settle().await;

    assert_eq!(
        snapshots.lock().last().cloned().unwrap(),
        vec![SimpleReceivedRequest {
            id: "q1".into(),
            requestor_pk: carol.public_key().to_string(),
            response: "enc1".into(),
            timestamp: Some(5),
        }]
    );

    h.put(&h.me().child(keys::CURRENT_HANDSHAKE_ADDRESS), json!("addrB"))
        .await;
    settle().await;
    assert!(h.engine.received_requests().unwrap().is_empty());

    h.put(
        &nodes.child("addrB").child("q4"),
        json!({ "response": "enc4", "from": carol.public_key() }),
    )
    .await;
    settle().await;
    let received = h.engine.received_requests().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, "q4");
}

#[tokio::test(start_paused = true)]
async fn test_sent_requests_flag_changed_address() {
    let h = harness().await;
    let bob = h.bob_pub();
    let carol = LocalIdentity::from_seed(&CAROL_SEED);

    h.put(
        &GraphPath::user(&bob).child(keys::CURRENT_HANDSHAKE_ADDRESS),
        json!("addrC"),
    )
    .await;
    h.put(
        &GraphPath::user(carol.public_key()).child(keys::CURRENT_HANDSHAKE_ADDRESS),
        json!("addrX"),
    )
    .await;

    let stored = h.me().child(keys::STORED_REQS);
    let to_bob = h.stored_request(&bob, "addrB", "s1").await;
    h.put(&stored.child("r1"), to_bob).await;
    let to_carol = h.stored_request(carol.public_key(), "addrX", "s2").await;
    h.put(&stored.child("r2"), to_carol).await;
    h.put(&stored.child("r3"), serde_json::Value::Null).await;

    let (seen, snapshots) = collect::<Vec<feedsync_core::SimpleSentRequest>>();
    let _sub = h.engine.on_sent_requests(seen).unwrap();
    settle().await;

    let sent = snapshots.lock().last().cloned().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].id, "r1");
    assert_eq!(sent[0].recipient_public_key, bob);
    assert_eq!(sent[0].handshake_address, "addrB");
    assert_eq!(sent[0].sent_req_id, "s1");
    assert!(sent[0].recipient_changed_request_address);
    assert_eq!(sent[1].id, "r2");
    assert!(!sent[1].recipient_changed_request_address);
    assert_eq!(h.engine.sent_requests().unwrap(), sent);
}

#[tokio::test(start_paused = true)]
async fn test_seed_backup() {
    let h = harness().await;
    let path = h.me().child(keys::SEED_BACKUP);

    let (seen, snapshots) = collect::<Option<String>>();
    let _sub = h.engine.on_seed_backup(seen).unwrap();

    let encrypted = h.engine.encrypt_for_self("correct horse").await.unwrap();
    h.put(&path, json!(encrypted)).await;
    settle().await;
    assert_eq!(snapshots.lock().last(), Some(&Some("correct horse".to_string())));

    // Non-strings are ignored
    h.put(&path, json!(42)).await;
    settle().await;
    assert_eq!(
        h.engine.seed_backup().unwrap(),
        Some("correct horse".to_string())
    );

    h.put(&path, json!("fs1:AAAA")).await;
    settle().await;
    assert_eq!(h.engine.seed_backup().unwrap(), None);
}

// ============================================================================
// Sessions and subscriptions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_not_authenticated() {
    let graph = Arc::new(MemoryGraph::new());
    let engine = FeedEngine::new(graph, FeedConfig::default()).unwrap();
    let (seen, _) = collect::<Vec<Chat>>();

    assert!(matches!(engine.on_chats(seen), Err(FeedError::NotAuthenticated)));
    assert!(matches!(engine.chats(), Err(FeedError::NotAuthenticated)));
    assert!(matches!(
        engine.current_handshake_address(),
        Err(FeedError::NotAuthenticated)
    ));
    assert!(matches!(
        engine.successful_handshake_exists("pubA").await,
        Err(FeedError::NotAuthenticated)
    ));
    assert!(matches!(
        engine.last_request_sent_id("pubA").await,
        Err(FeedError::NotAuthenticated)
    ));

    engine
        .login(LocalIdentity::from_seed(&common::ALICE_SEED))
        .await
        .unwrap();
    assert!(engine.is_authenticated());
    assert!(engine.chats().is_ok());

    engine.logout();
    assert!(!engine.is_authenticated());
    assert!(matches!(engine.seed_backup(), Err(FeedError::NotAuthenticated)));
}

#[tokio::test(start_paused = true)]
async fn test_login_publishes_encryption_key() {
    let h = harness().await;
    let identity = LocalIdentity::from_seed(&common::ALICE_SEED);
    assert_eq!(
        h.graph.get(&h.me().child(keys::EPUB)),
        Some(json!(identity.encryption_key().as_str()))
    );
    assert_eq!(h.engine.public_key().unwrap(), h.alice);
}

#[tokio::test(start_paused = true)]
async fn test_subscription_registry_errors() {
    let h = harness().await;
    let (seen, _) = collect::<Option<String>>();

    let sub = h.engine.on_current_handshake_address(seen.clone()).unwrap();
    assert!(matches!(
        h.engine.on_current_handshake_address(seen),
        Err(FeedError::AlreadySubscribed(_))
    ));

    sub.unsubscribe().unwrap();
    assert!(matches!(sub.unsubscribe(), Err(FeedError::NotSubscribed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_one_upstream_per_topic() {
    let h = harness().await;
    let path = h.me().child(keys::CURRENT_HANDSHAKE_ADDRESS);

    let mut subs = Vec::new();
    for _ in 0..3 {
        let (seen, _) = collect::<Option<String>>();
        subs.push(h.engine.on_current_handshake_address(seen).unwrap());
    }
    h.engine.current_handshake_address().unwrap();

    assert_eq!(h.graph.subscriber_count(&path), 1);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = FeedConfig {
        listener_debounce_ms: 0,
        ..FeedConfig::default()
    };
    let graph = Arc::new(MemoryGraph::new());
    assert!(matches!(
        FeedEngine::new(graph, config),
        Err(FeedError::Config(_))
    ));
}
