//! Encrypted wallet seed backup at `~me/seedBackup`.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::error::FeedResult;
use crate::keys;
use crate::session::SessionContext;
use crate::subscription::{Listener, Subscription};

pub(crate) fn on_seed_backup(
    ctx: &Arc<SessionContext>,
    listener: Listener<Option<String>>,
) -> FeedResult<Subscription> {
    let subscription = ctx.seed_backup.subscribe(listener)?;
    attach(ctx);
    Ok(subscription)
}

pub(crate) fn attach(ctx: &Arc<SessionContext>) {
    if !ctx.seed_backup.attach_once() {
        return;
    }

    let path = ctx.user_path().child(keys::SEED_BACKUP);
    let mut rx = ctx.store.subscribe_field(&path);
    let session = ctx.clone();

    ctx.spawn(async move {
        while let Some(value) = rx.recv().await {
            // Non-string payloads are ignored
            let Some(Value::String(encrypted)) = value else {
                continue;
            };
            let seed = session.decrypt_mine(&encrypted).await;
            if seed.is_none() {
                warn!("Could not decrypt seed backup");
            }
            session.seed_backup.publish(seed);
        }
    });
}
