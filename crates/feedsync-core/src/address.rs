//! Current handshake address.
//!
//! One upstream field subscription on `~me/currentHandshakeAddress` feeds a
//! single nullable value. Anything other than a string resets it to `None`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FeedResult;
use crate::keys;
use crate::session::SessionContext;
use crate::subscription::{Listener, Subscription};

/// Subscribe to the current handshake address.
pub(crate) fn on_current_handshake_address(
    ctx: &Arc<SessionContext>,
    listener: Listener<Option<String>>,
) -> FeedResult<Subscription> {
    let subscription = ctx.address.subscribe(listener)?;
    attach(ctx);
    Ok(subscription)
}

/// Attach the upstream subscription if it is not attached yet.
pub(crate) fn attach(ctx: &Arc<SessionContext>) {
    if !ctx.address.attach_once() {
        return;
    }

    let path = ctx.user_path().child(keys::CURRENT_HANDSHAKE_ADDRESS);
    let mut rx = ctx.store.subscribe_field(&path);
    let topic = ctx.address.clone();

    ctx.spawn(async move {
        while let Some(value) = rx.recv().await {
            match value {
                Some(Value::String(address)) => {
                    debug!(%address, "Handshake address changed");
                    topic.publish(Some(address));
                }
                other => {
                    warn!(value = ?other, "Expected handshake address to be a string");
                    topic.publish(None);
                }
            }
        }
    });
}
