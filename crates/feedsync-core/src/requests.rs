//! Simplified views of pending contact requests.
//!
//! Received requests are the handshake requests sitting at our current
//! handshake address, minus those from peers we are already connected to.
//! When the address changes the watcher is moved to the new address.
//!
//! Sent requests are our own live stored requests, decrypted.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::address;
use crate::error::FeedResult;
use crate::incoming::{self, IncomingIndex};
use crate::keys;
use crate::schema;
use crate::session::SessionContext;
use crate::store::GraphPath;
use crate::subscription::{self, Listener, Subscription};

/// A contact request someone sent to our handshake address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleReceivedRequest {
    pub id: String,
    #[serde(rename = "requestorPK")]
    pub requestor_pk: String,
    /// Still encrypted with the pairwise secret
    pub response: String,
    pub timestamp: Option<i64>,
}

/// A contact request we sent and that has not been retired yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleSentRequest {
    pub id: String,
    pub recipient_public_key: String,
    pub handshake_address: String,
    #[serde(rename = "sentReqID")]
    pub sent_req_id: String,
    /// The recipient now advertises a different handshake address
    pub recipient_changed_request_address: bool,
    pub timestamp: Option<i64>,
}

/// Raw handshake requests at the watched address.
#[derive(Default)]
struct ReceivedState {
    address: Option<String>,
    watcher: Option<AbortHandle>,
    raw: BTreeMap<String, Value>,
}

pub(crate) fn on_received_requests(
    ctx: &Arc<SessionContext>,
    listener: Listener<Vec<SimpleReceivedRequest>>,
) -> FeedResult<Subscription> {
    let subscription = ctx.received_requests.subscribe(listener)?;
    attach_received(ctx)?;
    Ok(subscription)
}

pub(crate) fn attach_received(ctx: &Arc<SessionContext>) -> FeedResult<()> {
    if !ctx.received_requests.attach_once() {
        return Ok(());
    }

    let state: Arc<Mutex<ReceivedState>> = Arc::default();

    let weak = Arc::downgrade(ctx);
    let on_address_state = state.clone();
    ctx.address
        .subscribe(subscription::listener(move |address: &Option<String>| {
            if let Some(session) = weak.upgrade() {
                watch_address(&session, &on_address_state, address.clone());
            }
        }))?;

    let weak: Weak<SessionContext> = Arc::downgrade(ctx);
    let on_index_state = state;
    ctx.incoming_index
        .subscribe(subscription::listener(move |index: &IncomingIndex| {
            if let Some(session) = weak.upgrade() {
                let received = simplify_received(&on_index_state.lock().raw, index);
                session.received_requests.publish(received);
            }
        }))?;

    address::attach(ctx);
    incoming::attach_index(ctx);
    Ok(())
}

fn watch_address(ctx: &Arc<SessionContext>, state: &Arc<Mutex<ReceivedState>>, address: Option<String>) {
    let mut guard = state.lock();
    if guard.address == address {
        return;
    }

    if let Some(watcher) = guard.watcher.take() {
        watcher.abort();
    }
    guard.raw.clear();
    guard.address = address.clone();
    ctx.received_requests.publish(Vec::new());

    let Some(address) = address else {
        debug!("No handshake address, not watching for requests");
        return;
    };

    debug!(%address, "Watching handshake address");
    let path = GraphPath::root().child(keys::HANDSHAKE_NODES).child(&address);
    let mut rx = ctx.store.subscribe_children(&path);
    let session = ctx.clone();
    let task_state = state.clone();
    guard.watcher = Some(ctx.spawn(async move {
        while let Some(event) = rx.recv().await {
            let received = {
                let mut state = task_state.lock();
                if state.address.as_deref() != Some(address.as_str()) {
                    break;
                }
                state.raw.insert(event.key, event.value);
                simplify_received(&state.raw, &session.incoming_index.current())
            };
            session.received_requests.publish(received);
        }
    }));
}

fn simplify_received(raw: &BTreeMap<String, Value>, index: &IncomingIndex) -> Vec<SimpleReceivedRequest> {
    raw.iter()
        .filter_map(|(id, value)| {
            let request = schema::parse_handshake_request(value).ok()?;
            let requestor = request.from?;
            let connected = matches!(index.get(&requestor), Some(Some(_)));
            (!connected).then(|| SimpleReceivedRequest {
                id: id.clone(),
                requestor_pk: requestor,
                response: request.response,
                timestamp: request.timestamp,
            })
        })
        .collect()
}

pub(crate) fn on_sent_requests(
    ctx: &Arc<SessionContext>,
    listener: Listener<Vec<SimpleSentRequest>>,
) -> FeedResult<Subscription> {
    let subscription = ctx.sent_requests.subscribe(listener)?;
    attach_sent(ctx);
    Ok(subscription)
}

pub(crate) fn attach_sent(ctx: &Arc<SessionContext>) {
    if !ctx.sent_requests.attach_once() {
        return;
    }

    let path = ctx.user_path().child(keys::STORED_REQS);
    let mut rx = ctx.store.subscribe_children(&path);
    let session = ctx.clone();

    ctx.spawn(async move {
        let mut raw: BTreeMap<String, Value> = BTreeMap::new();
        while let Some(event) = rx.recv().await {
            raw.insert(event.key, event.value);
            let sent = simplify_sent(&session, &raw).await;
            session.sent_requests.publish(sent);
        }
    });
}

async fn simplify_sent(ctx: &SessionContext, raw: &BTreeMap<String, Value>) -> Vec<SimpleSentRequest> {
    let mut sent = Vec::new();

    for (id, value) in raw {
        if value.is_null() {
            continue;
        }
        let stored = match schema::parse_stored_request(value) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(request_id = %id, error = %e, "Skipping malformed stored request");
                continue;
            }
        };

        let (Some(recipient), Some(handshake_address), Some(sent_req_id)) = (
            ctx.decrypt_mine(&stored.recipient_pub).await,
            ctx.decrypt_mine(&stored.handshake_address).await,
            ctx.decrypt_mine(&stored.sent_req_id).await,
        ) else {
            warn!(request_id = %id, "Could not decrypt stored request");
            continue;
        };

        let current_address = ctx
            .store
            .once(&GraphPath::user(&recipient).child(keys::CURRENT_HANDSHAKE_ADDRESS))
            .await
            .ok()
            .flatten();
        let recipient_changed_request_address =
            current_address.as_ref().and_then(Value::as_str) != Some(handshake_address.as_str());

        sent.push(SimpleSentRequest {
            id: id.clone(),
            recipient_public_key: recipient,
            handshake_address,
            sent_req_id,
            recipient_changed_request_address,
            timestamp: stored.timestamp,
        });
    }

    sent
}
