//! Chat derivation.
//!
//! A [`Chat`] pairs one of our live outgoing feeds with whatever the peer
//! writes back to us. Chats are recomputed from two inputs, the committed
//! [`Outgoings`] and the [`PubToFeed`] map, on a trailing-edge window, and are
//! never persisted.
//!
//! `PubToFeed` is assembled here from the `userToIncoming` index: a nulled
//! entry marks the peer as disconnected, a feed id attaches that peer's
//! incoming feed. A chat is only shown once its peer has an entry there.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::FeedResult;
use crate::incoming::{self, IncomingIndex, IncomingMessages};
use crate::outgoing::{self, Outgoings};
use crate::session::SessionContext;
use crate::subscription::{self, Listener, Subscription};

/// One message inside a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    /// `true` when we wrote it
    pub outgoing: bool,
    pub body: String,
    pub timestamp: i64,
}

/// What we know about a peer's side of the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedState {
    Messages(Vec<ChatMessage>),
    Disconnected,
}

/// peer public key -> incoming side
pub type PubToFeed = BTreeMap<String, FeedState>;

/// A conversation with one peer over one outgoing feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Peer public key followed by the outgoing feed id
    pub id: String,
    pub recipient_public_key: String,
    pub messages: Vec<ChatMessage>,
    pub did_disconnect: bool,
    pub recipient_avatar: Option<String>,
    pub recipient_display_name: Option<String>,
    pub last_seen_app: Option<i64>,
}

/// Merge outgoing feeds with the incoming side of each peer.
///
/// Outgoing messages come first (only those whose body decrypted), followed
/// by the peer's incoming messages. Peers without a `PubToFeed` entry are
/// left out.
pub fn derive_chats(outgoings: &Outgoings, pub_to_feed: &PubToFeed) -> Vec<Chat> {
    outgoings
        .iter()
        .filter_map(|(feed_id, outgoing)| outgoing.as_ref().map(|o| (feed_id, o)))
        .filter_map(|(feed_id, outgoing)| {
            let state = pub_to_feed.get(&outgoing.with)?;

            let mut messages: Vec<ChatMessage> = outgoing
                .messages
                .iter()
                .filter_map(|(id, m)| {
                    m.body.as_ref().map(|body| ChatMessage {
                        id: id.clone(),
                        outgoing: true,
                        body: body.clone(),
                        timestamp: m.timestamp,
                    })
                })
                .collect();

            if let FeedState::Messages(incoming) = state {
                messages.extend(incoming.iter().cloned());
            }

            Some(Chat {
                id: format!("{}{}", outgoing.with, feed_id),
                recipient_public_key: outgoing.with.clone(),
                messages,
                did_disconnect: matches!(state, FeedState::Disconnected),
                recipient_avatar: None,
                recipient_display_name: None,
                last_seen_app: None,
            })
        })
        .collect()
}

/// Incoming messages of one peer as chat messages, oldest first.
fn to_chat_messages(messages: &IncomingMessages) -> Vec<ChatMessage> {
    let mut out: Vec<ChatMessage> = messages
        .iter()
        .map(|(id, m)| ChatMessage {
            id: id.clone(),
            outgoing: false,
            body: m.body.clone(),
            timestamp: m.timestamp,
        })
        .collect();
    out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    out
}

pub(crate) fn on_chats(
    ctx: &Arc<SessionContext>,
    listener: Listener<Vec<Chat>>,
) -> FeedResult<Subscription> {
    let subscription = ctx.chats.subscribe(listener)?;
    attach(ctx)?;
    Ok(subscription)
}

pub(crate) fn attach(ctx: &Arc<SessionContext>) -> FeedResult<()> {
    if !ctx.chats.attach_once() {
        return Ok(());
    }

    let log_count = subscription::listener(|chats: &Vec<Chat>| {
        info!(count = chats.len(), "Chats");
    });
    ctx.chats.subscribe(log_count)?;

    let (debouncer, mut triggers) = subscription::debounce::<()>(ctx.config.chats_window());
    let debouncer = Arc::new(debouncer);

    let session = ctx.clone();
    ctx.spawn(async move {
        while triggers.recv().await.is_some() {
            let chats = derive_chats(&session.outgoings.current(), &session.pub_to_feed.current());
            session.chats.publish(chats);
        }
    });

    let on_outgoings = debouncer.clone();
    ctx.outgoings
        .subscribe(subscription::listener(move |_: &Outgoings| on_outgoings.schedule(())))?;
    let on_pub_to_feed = debouncer;
    ctx.pub_to_feed
        .subscribe(subscription::listener(move |_: &PubToFeed| on_pub_to_feed.schedule(())))?;

    outgoing::attach(ctx);
    attach_pub_to_feed(ctx)?;
    Ok(())
}

/// Per-peer state of the `PubToFeed` assembly: `None` once disconnected,
/// otherwise the attached feed id and its subscription.
type AttachedFeeds = HashMap<String, Option<(String, Subscription)>>;

/// Keep `PubToFeed` in step with the `userToIncoming` index.
fn attach_pub_to_feed(ctx: &Arc<SessionContext>) -> FeedResult<()> {
    if !ctx.pub_to_feed.attach_once() {
        return Ok(());
    }

    let attached: Arc<Mutex<AttachedFeeds>> = Arc::default();
    let weak: Weak<SessionContext> = Arc::downgrade(ctx);

    ctx.incoming_index
        .subscribe(subscription::listener(move |index: &IncomingIndex| {
            if let Some(session) = weak.upgrade() {
                sync_pub_to_feed(&session, index, &attached);
            }
        }))?;

    incoming::attach_index(ctx);
    Ok(())
}

fn sync_pub_to_feed(ctx: &Arc<SessionContext>, index: &IncomingIndex, attached: &Mutex<AttachedFeeds>) {
    let mut attached = attached.lock();

    for (peer, entry) in index {
        let known = attached
            .get(peer)
            .map(|slot| slot.as_ref().map(|(feed_id, _)| feed_id));
        if known == Some(entry.as_ref()) {
            continue;
        }

        if let Some(Some((_, old))) = attached.remove(peer) {
            if let Err(e) = old.unsubscribe() {
                debug!(%peer, error = %e, "Incoming feed listener already removed");
            }
        }

        match entry {
            None => {
                debug!(%peer, "Peer disconnected");
                ctx.pub_to_feed.update(|map| {
                    map.insert(peer.clone(), FeedState::Disconnected);
                });
                attached.insert(peer.clone(), None);
            }
            Some(feed_id) => {
                debug!(%peer, %feed_id, "Attaching incoming feed");
                let weak = Arc::downgrade(ctx);
                let owner = peer.clone();
                let on_messages = subscription::listener(move |messages: &IncomingMessages| {
                    if let Some(session) = weak.upgrade() {
                        let chat_messages = to_chat_messages(messages);
                        session.pub_to_feed.update(|map| {
                            map.insert(owner.clone(), FeedState::Messages(chat_messages));
                        });
                    }
                });
                match incoming::incoming_topic(ctx, peer, feed_id).subscribe(on_messages) {
                    Ok(sub) => {
                        attached.insert(peer.clone(), Some((feed_id.clone(), sub)));
                    }
                    Err(e) => debug!(%peer, error = %e, "Could not attach incoming feed"),
                }
            }
        }
    }
}
