//! Outgoing feeds: what we write for each peer.
//!
//! The whole `~me/outgoings` subtree is watched as one field. Raw snapshots
//! are debounced, then decrypted as a unit:
//!
//! 1. a non-object snapshot resets the map to empty
//! 2. tombstoned feeds are kept as `None`; malformed entries are skipped
//! 3. `with` is decrypted with the local secret, message bodies with the
//!    pairwise secret of that peer
//! 4. the result replaces the committed map in one step
//!
//! If a snapshot fails as a whole (e.g. a peer's encryption key cannot be
//! resolved) the error is logged and the previous map stays committed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::FeedResult;
use crate::keys;
use crate::schema::{self, OutgoingEntry};
use crate::session::SessionContext;
use crate::subscription::{self, Listener, Subscription};

/// A decrypted outgoing message. `body` is `None` when it did not decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub body: Option<String>,
    pub timestamp: i64,
}

/// A decrypted outgoing feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outgoing {
    /// Public key of the peer this feed is for
    pub with: String,
    pub messages: BTreeMap<String, OutgoingMessage>,
}

/// feed id -> feed, `None` for tombstoned feeds
pub type Outgoings = BTreeMap<String, Option<Outgoing>>;

pub(crate) fn on_outgoing(
    ctx: &Arc<SessionContext>,
    listener: Listener<Outgoings>,
) -> FeedResult<Subscription> {
    let subscription = ctx.outgoings.subscribe(listener)?;
    attach(ctx);
    Ok(subscription)
}

/// Attach the upstream subscription and the telemetry listener once.
pub(crate) fn attach(ctx: &Arc<SessionContext>) {
    if !ctx.outgoings.attach_once() {
        return;
    }

    let log_counts = subscription::listener(|outgoings: &Outgoings| {
        let tombstones = outgoings.values().filter(|o| o.is_none()).count();
        info!(
            tombstones,
            live = outgoings.len() - tombstones,
            "New outgoings"
        );
    });
    if let Err(e) = ctx.outgoings.subscribe(log_counts) {
        warn!(error = %e, "Could not register outgoings telemetry");
    }

    let path = ctx.user_path().child(keys::OUTGOINGS);
    let mut raw = ctx.store.subscribe_field(&path);
    let (debouncer, mut snapshots) = subscription::debounce(ctx.config.outgoing_window());

    ctx.spawn(async move {
        while let Some(value) = raw.recv().await {
            debouncer.schedule(value);
        }
    });

    let session = ctx.clone();
    ctx.spawn(async move {
        while let Some(snapshot) = snapshots.recv().await {
            match reconcile(&session, snapshot).await {
                Ok(outgoings) => session.outgoings.publish(outgoings),
                Err(e) => error!(error = %e, "Outgoings snapshot failed, keeping previous"),
            }
        }
    });
}

/// Decrypt one raw snapshot of the outgoing map.
pub(crate) async fn reconcile(ctx: &SessionContext, snapshot: Option<Value>) -> FeedResult<Outgoings> {
    let Some(Value::Object(entries)) = snapshot else {
        debug!("Outgoings snapshot is not an object, resetting");
        return Ok(Outgoings::new());
    };

    let mut outgoings = Outgoings::new();

    for (feed_id, raw) in entries {
        let (encrypted_with, raw_messages) = match schema::parse_outgoing_entry(&raw) {
            Ok(OutgoingEntry::Tombstone) => {
                outgoings.insert(feed_id, None);
                continue;
            }
            Ok(OutgoingEntry::Live { with, messages }) => (with, messages),
            Err(e) => {
                debug!(%feed_id, error = %e, "Skipping malformed outgoing");
                continue;
            }
        };

        let Some(with) = ctx.decrypt_mine(&encrypted_with).await else {
            warn!(%feed_id, "Could not decrypt outgoing recipient");
            continue;
        };

        let secret = ctx.pair_secret(&with).await?;

        let mut messages = BTreeMap::new();
        for (message_id, raw_message) in raw_messages {
            let message = match schema::parse_message(&raw_message) {
                Ok(message) => message,
                Err(e) => {
                    debug!(%feed_id, %message_id, error = %e, "Skipping malformed outgoing message");
                    continue;
                }
            };
            let body = ctx.crypto.decrypt(&message.body, &secret).await;
            messages.insert(
                message_id,
                OutgoingMessage {
                    body,
                    timestamp: message.timestamp,
                },
            );
        }

        outgoings.insert(feed_id, Some(Outgoing { with, messages }));
    }

    Ok(outgoings)
}
