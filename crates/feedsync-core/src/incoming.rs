//! Incoming feeds: what peers write for us.
//!
//! Two streams live here:
//!
//! - the `userToIncoming` index, mapping each peer to the id of the feed they
//!   write for us (or to a disconnect marker when the entry is nulled)
//! - one decrypted message map per `(peer, feed id)`, read from the peer's
//!   `outgoings/<feed id>/messages`
//!
//! Malformed entries are logged and skipped without touching what was already
//! accumulated; entries that do not decrypt are skipped silently.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::error::FeedResult;
use crate::keys;
use crate::schema::{self, Message};
use crate::session::SessionContext;
use crate::store::GraphPath;
use crate::subscription::{Listener, Subscription, Topic};

/// message id -> decrypted message
pub type IncomingMessages = BTreeMap<String, Message>;

/// peer public key -> incoming feed id, `None` once the peer disconnected
pub type IncomingIndex = BTreeMap<String, Option<String>>;

/// Subscribe to the decrypted messages `peer` writes in `feed_id`.
///
/// The listener receives the accumulated map immediately (empty on first
/// use) and then debounced snapshots as messages arrive.
pub(crate) fn on_incoming_messages(
    ctx: &Arc<SessionContext>,
    peer: &str,
    feed_id: &str,
    listener: Listener<IncomingMessages>,
) -> FeedResult<Subscription> {
    incoming_topic(ctx, peer, feed_id).subscribe(listener)
}

/// Shared topic for one incoming feed, created with its upstream on first use.
pub(crate) fn incoming_topic(
    ctx: &Arc<SessionContext>,
    peer: &str,
    feed_id: &str,
) -> Arc<Topic<IncomingMessages>> {
    let key = (peer.to_string(), feed_id.to_string());
    let mut feeds = ctx.incoming_feeds.lock();
    if let Some(topic) = feeds.get(&key) {
        return topic.clone();
    }

    let topic = Topic::debounced(
        format!("incoming/{}/{}", peer, feed_id),
        IncomingMessages::new(),
        ctx.config.listener_window(),
    );
    feeds.insert(key, topic.clone());
    drop(feeds);

    topic.attach_once();
    spawn_feed_reader(ctx, peer.to_string(), feed_id.to_string(), topic.clone());
    topic
}

fn spawn_feed_reader(
    ctx: &Arc<SessionContext>,
    peer: String,
    feed_id: String,
    topic: Arc<Topic<IncomingMessages>>,
) {
    let path = GraphPath::user(&peer)
        .child(keys::OUTGOINGS)
        .child(&feed_id)
        .child(keys::MESSAGES);
    let mut rx = ctx.store.subscribe_children(&path);
    let session = ctx.clone();

    debug!(%peer, %feed_id, "Reading incoming feed");
    ctx.spawn(async move {
        while let Some(event) = rx.recv().await {
            let message = match schema::parse_message(&event.value) {
                Ok(message) => message,
                Err(e) => {
                    warn!(%peer, %feed_id, message_id = %event.key, error = %e, "Non-message received");
                    continue;
                }
            };

            let secret = match session.pair_secret(&peer).await {
                Ok(secret) => secret,
                Err(e) => {
                    warn!(%peer, error = %e, "No pairwise secret for incoming feed");
                    continue;
                }
            };

            let Some(body) = session.crypto.decrypt(&message.body, &secret).await else {
                trace!(%peer, message_id = %event.key, "Incoming message did not decrypt");
                continue;
            };

            topic.update(|messages| {
                messages.insert(
                    event.key,
                    Message {
                        body,
                        timestamp: message.timestamp,
                    },
                );
            });
        }
    });
}

/// Subscribe to the connected part of `userToIncoming` (peer -> feed id).
pub(crate) fn on_user_to_incoming(
    ctx: &Arc<SessionContext>,
    listener: Listener<BTreeMap<String, String>>,
) -> FeedResult<Subscription> {
    let subscription = ctx.user_to_incoming.subscribe(listener)?;
    attach_index(ctx);
    Ok(subscription)
}

/// Attach the `userToIncoming` upstream if it is not attached yet.
pub(crate) fn attach_index(ctx: &Arc<SessionContext>) {
    if !ctx.incoming_index.attach_once() {
        return;
    }

    let path = ctx.user_path().child(keys::USER_TO_INCOMING);
    let mut rx = ctx.store.subscribe_children(&path);
    let session = ctx.clone();

    ctx.spawn(async move {
        while let Some(event) = rx.recv().await {
            let peer = event.key;
            let entry = match event.value {
                Value::Null => None,
                Value::String(encrypted) if encrypted.is_empty() => {
                    error!(%peer, "Got an empty string inside user to incoming");
                    continue;
                }
                Value::String(encrypted) => match session.decrypt_mine(&encrypted).await {
                    Some(feed_id) => Some(feed_id),
                    None => {
                        warn!(%peer, "Could not decrypt incoming feed id");
                        continue;
                    }
                },
                other => {
                    error!(%peer, value = %other, "Got a non string non null value inside user to incoming");
                    continue;
                }
            };

            session.incoming_index.update(|index| {
                index.insert(peer.clone(), entry.clone());
            });
            session.user_to_incoming.update(|connected| match entry {
                Some(feed_id) => {
                    connected.insert(peer, feed_id);
                }
                None => {
                    connected.remove(&peer);
                }
            });
        }
    });
}
