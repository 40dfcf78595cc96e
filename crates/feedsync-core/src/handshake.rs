//! Handshake acceptance.
//!
//! Every stored request we sent is re-examined whenever the store notifies us
//! about it. A run walks the steps below and stops at the first that does not
//! apply:
//!
//! ```text
//! validate ─► decrypt fields ─► already connected? ─► stale? ─► watch handshake node
//!    │              │                  │                 │            │
//! Discarded     Discarded          Discarded         Discarded    decrypt feed id ◄──┐
//!                                                                      │             │
//!                                                               poll peer feed ──────┘
//!                                                                 (bounded)   gave up:
//!                                                                      │      Abandoned
//!                   Committed ◄── tombstone request ◄── write userToIncoming
//! ```
//!
//! The handshake node stays subscribed for the life of the run. It first
//! holds our own response and changes when the peer accepts, so each new
//! value is tried in turn until one commits or the session ends.
//!
//! Runs are keyed by request id. While a run is in flight, further
//! notifications for the same id replace a single queued value, which is
//! processed once the current run ends. Failures are contained to their id.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::keys;
use crate::retry::{self, RetryOutcome};
use crate::crypto::Secret;
use crate::schema;
use crate::session::SessionContext;
use crate::store::GraphPath;

/// Why a run ended without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The stored request was nulled out after a previous success
    Tombstoned,
    /// The stored request does not have the expected shape
    Invalid,
    /// A field did not decrypt to a string
    Undecryptable,
    /// We are already connected to the recipient
    AlreadyConnected,
    /// A newer request was sent to the recipient since
    Stale,
}

/// Final state of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Committed { recipient: String, feed_id: String },
    Discarded(DiscardReason),
}

/// Protocol events broadcast to embedders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// The peer's feed was recorded in `userToIncoming`
    Committed {
        request_id: String,
        recipient: String,
        feed_id: String,
    },
    /// The run ended without effect
    Discarded {
        request_id: String,
        reason: DiscardReason,
    },
    /// The feed named by one response never became visible. The run keeps
    /// waiting for the next response.
    Abandoned {
        request_id: String,
        feed_id: String,
        attempts: u32,
    },
    /// The run failed
    Failed { request_id: String, message: String },
}

/// Attach the handshake job to `~me/storedReqs`.
pub(crate) fn start(ctx: &Arc<SessionContext>) {
    let path = ctx.user_path().child(keys::STORED_REQS);
    let mut rx = ctx.store.subscribe_children(&path);
    let runner = Arc::new(RequestRunner {
        ctx: ctx.clone(),
        inflight: Mutex::new(HashMap::new()),
    });

    info!(user = %ctx.public_key(), "Watching stored requests");
    ctx.spawn(async move {
        while let Some(event) = rx.recv().await {
            runner.dispatch(event.key, event.value);
        }
    });
}

struct RequestRunner {
    ctx: Arc<SessionContext>,
    /// request id -> latest value queued behind the running instance
    inflight: Mutex<HashMap<String, Option<Value>>>,
}

impl RequestRunner {
    fn dispatch(self: &Arc<Self>, request_id: String, value: Value) {
        {
            let mut inflight = self.inflight.lock();
            if let Some(queued) = inflight.get_mut(&request_id) {
                debug!(%request_id, "Run in flight, queueing latest value");
                *queued = Some(value);
                return;
            }
            inflight.insert(request_id.clone(), None);
        }

        let runner = self.clone();
        self.ctx.spawn(async move { runner.run(request_id, value).await });
    }

    async fn run(&self, request_id: String, mut value: Value) {
        loop {
            let result = process(&self.ctx, &request_id, &value).await;
            report(&self.ctx, &request_id, result);

            let next = {
                let mut inflight = self.inflight.lock();
                match inflight.get_mut(&request_id).and_then(Option::take) {
                    Some(next) => Some(next),
                    None => {
                        inflight.remove(&request_id);
                        None
                    }
                }
            };
            match next {
                Some(next) => value = next,
                None => break,
            }
        }
    }
}

fn report(ctx: &SessionContext, request_id: &str, result: FeedResult<HandshakeOutcome>) {
    let request_id = request_id.to_string();
    let event = match result {
        Ok(HandshakeOutcome::Committed { recipient, feed_id }) => {
            info!(%request_id, %recipient, %feed_id, "Handshake committed");
            HandshakeEvent::Committed {
                request_id,
                recipient,
                feed_id,
            }
        }
        Ok(HandshakeOutcome::Discarded(reason)) => HandshakeEvent::Discarded { request_id, reason },
        Err(e) => {
            error!(%request_id, error = %e, "Handshake acceptance failed");
            HandshakeEvent::Failed {
                request_id,
                message: e.to_string(),
            }
        }
    };
    ctx.emit(event);
}

/// One run of the protocol for one stored request.
pub(crate) async fn process(
    ctx: &SessionContext,
    request_id: &str,
    value: &Value,
) -> FeedResult<HandshakeOutcome> {
    if value.is_null() {
        debug!(%request_id, "Stored request is a tombstone");
        return Ok(HandshakeOutcome::Discarded(DiscardReason::Tombstoned));
    }

    let stored = match schema::parse_stored_request(value) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(%request_id, error = %e, "Not a stored request");
            return Ok(HandshakeOutcome::Discarded(DiscardReason::Invalid));
        }
    };

    // Recipient from our own stored copy, never from the public handshake node
    let Some(recipient) = ctx.decrypt_mine(&stored.recipient_pub).await else {
        warn!(%request_id, "Could not decrypt recipient of stored request");
        return Ok(HandshakeOutcome::Discarded(DiscardReason::Undecryptable));
    };

    if successful_handshake_exists(ctx, &recipient).await? {
        debug!(%request_id, %recipient, "Already connected");
        return Ok(HandshakeOutcome::Discarded(DiscardReason::AlreadyConnected));
    }

    let (Some(address), Some(sent_req_id)) = (
        ctx.decrypt_mine(&stored.handshake_address).await,
        ctx.decrypt_mine(&stored.sent_req_id).await,
    ) else {
        warn!(%request_id, "Could not decrypt stored request fields");
        return Ok(HandshakeOutcome::Discarded(DiscardReason::Undecryptable));
    };

    let latest = last_request_sent_id(ctx, &recipient).await?;
    if latest.as_deref() != Some(sent_req_id.as_str()) {
        debug!(%request_id, %sent_req_id, latest = ?latest, "Stale request");
        return Ok(HandshakeOutcome::Discarded(DiscardReason::Stale));
    }

    let secret = ctx.pair_secret(&recipient).await?;
    let node_path = GraphPath::root()
        .child(keys::HANDSHAKE_NODES)
        .child(&address)
        .child(&sent_req_id);
    let mut rx = ctx.store.subscribe_field(&node_path);

    // Each value at the node gets its own attempt
    loop {
        let mut current = match rx.recv().await {
            Some(current) => current,
            None => {
                return Err(FeedError::Store(format!(
                    "subscription to {} closed before a response was accepted",
                    node_path
                )))
            }
        };
        while let Ok(next) = rx.try_recv() {
            current = next;
        }
        let Some(node) = current else {
            continue;
        };

        if last_request_sent_id(ctx, &recipient).await?.as_deref() != Some(sent_req_id.as_str()) {
            debug!(%request_id, %sent_req_id, "Request superseded while waiting for a response");
            return Ok(HandshakeOutcome::Discarded(DiscardReason::Stale));
        }

        match accept_response(ctx, request_id, &recipient, &secret, &node).await {
            Ok(feed_id) => return Ok(HandshakeOutcome::Committed { recipient, feed_id }),
            Err(FeedError::FeedNotVisible { feed_id, attempts }) => {
                warn!(%request_id, %feed_id, attempts, "Feed never became visible, waiting for a new response");
                ctx.emit(HandshakeEvent::Abandoned {
                    request_id: request_id.to_string(),
                    feed_id,
                    attempts,
                });
            }
            Err(e @ (FeedError::Validation(_) | FeedError::Decryption(_))) => {
                warn!(%request_id, error = %e, "Ignoring handshake node value");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decrypt the feed id in one handshake node value, wait for the peer's
/// feed, then record it and tombstone the stored request.
async fn accept_response(
    ctx: &SessionContext,
    request_id: &str,
    recipient: &str,
    secret: &Secret,
    node: &Value,
) -> FeedResult<String> {
    let handshake_request = schema::parse_handshake_request(node)?;

    // Either side may have written the response last; both encrypt it with
    // the same pairwise secret
    let feed_id = ctx
        .crypto
        .decrypt(&handshake_request.response, secret)
        .await
        .ok_or_else(|| FeedError::Decryption(format!("response of request {}", request_id)))?;
    info!(%request_id, %feed_id, "Decrypted feed id");

    let feed_path = GraphPath::user(recipient)
        .child(keys::OUTGOINGS)
        .child(&feed_id);
    let outcome = retry::poll_until("feed visibility", &ctx.config.feed_retry, |_| {
        let feed_path = &feed_path;
        async move {
            match ctx.store.once(feed_path).await {
                Ok(Some(Value::Object(feed))) if !feed.is_empty() => Some(()),
                _ => None,
            }
        }
    })
    .await;
    if let RetryOutcome::GaveUp { attempts } = outcome {
        return Err(FeedError::FeedNotVisible { feed_id, attempts });
    }

    let encrypted_feed_id = ctx.encrypt_mine(&feed_id).await?;
    let user = ctx.user_path();
    ctx.write_checked(
        &user.child(keys::USER_TO_INCOMING).child(recipient),
        Value::String(encrypted_feed_id),
    )
    .await?;
    ctx.write_checked(&user.child(keys::STORED_REQS).child(request_id), Value::Null)
        .await?;

    Ok(feed_id)
}

/// Whether both directions of a conversation with `peer` are recorded.
pub(crate) async fn successful_handshake_exists(ctx: &SessionContext, peer: &str) -> FeedResult<bool> {
    let user = ctx.user_path();
    let incoming = ctx
        .store
        .once(&user.child(keys::USER_TO_INCOMING).child(peer))
        .await?;
    let outgoing = ctx
        .store
        .once(&user.child(keys::RECIPIENT_TO_OUTGOING).child(peer))
        .await?;

    match (incoming, outgoing) {
        (Some(Value::String(incoming)), Some(Value::String(outgoing))) => {
            Ok(ctx.decrypt_mine(&incoming).await.is_some() && ctx.decrypt_mine(&outgoing).await.is_some())
        }
        _ => Ok(false),
    }
}

/// Id of the latest request sent to `peer`, if any.
pub(crate) async fn last_request_sent_id(ctx: &SessionContext, peer: &str) -> FeedResult<Option<String>> {
    let path = ctx
        .user_path()
        .child(keys::USER_TO_LAST_REQUEST_SENT)
        .child(peer);
    match ctx.store.once(&path).await? {
        Some(Value::String(id)) => Ok(Some(id)),
        _ => Ok(None),
    }
}
