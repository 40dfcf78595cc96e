//! Per-login session state.
//!
//! Everything that lives for the duration of one authenticated session is
//! owned by a [`SessionContext`]: the local secret, pairwise secret cache,
//! every topic, and the background tasks attached to the store. It is built
//! by [`FeedEngine::login`](crate::engine::FeedEngine::login) and torn down
//! by `logout`, which aborts the tasks.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::chats::{Chat, PubToFeed};
use crate::config::FeedConfig;
use crate::crypto::{CryptoProvider, Secret};
use crate::error::{FeedError, FeedResult};
use crate::handshake::HandshakeEvent;
use crate::identity::LocalIdentity;
use crate::incoming::{IncomingIndex, IncomingMessages};
use crate::outgoing::Outgoings;
use crate::requests::{SimpleReceivedRequest, SimpleSentRequest};
use crate::store::{GraphPath, GraphStore, WriteAck};
use crate::subscription::Topic;

/// Topic names, used in errors and logs.
pub mod topics {
    pub const ADDRESS: &str = "currentHandshakeAddress";
    pub const OUTGOINGS: &str = "outgoings";
    pub const CHATS: &str = "chats";
    pub const PUB_TO_FEED: &str = "pubToFeed";
    pub const USER_TO_INCOMING: &str = "userToIncoming";
    pub const INCOMING_INDEX: &str = "incomingIndex";
    pub const SEED_BACKUP: &str = "seedBackup";
    pub const RECEIVED_REQUESTS: &str = "receivedRequests";
    pub const SENT_REQUESTS: &str = "sentRequests";
}

/// State shared by every task of one authenticated session.
pub struct SessionContext {
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) config: FeedConfig,
    pub(crate) identity: LocalIdentity,
    my_secret: Secret,
    /// peer public key -> pairwise secret
    pair_secrets: RwLock<HashMap<String, Secret>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<HandshakeEvent>,

    pub(crate) address: Arc<Topic<Option<String>>>,
    pub(crate) outgoings: Arc<Topic<Outgoings>>,
    pub(crate) chats: Arc<Topic<Vec<Chat>>>,
    pub(crate) pub_to_feed: Arc<Topic<PubToFeed>>,
    pub(crate) user_to_incoming: Arc<Topic<BTreeMap<String, String>>>,
    pub(crate) incoming_index: Arc<Topic<IncomingIndex>>,
    pub(crate) seed_backup: Arc<Topic<Option<String>>>,
    pub(crate) received_requests: Arc<Topic<Vec<SimpleReceivedRequest>>>,
    pub(crate) sent_requests: Arc<Topic<Vec<SimpleSentRequest>>>,
    /// (peer, feed id) -> incoming feed topic
    pub(crate) incoming_feeds: Mutex<HashMap<(String, String), Arc<Topic<IncomingMessages>>>>,
}

impl SessionContext {
    /// Build the session. Must be called within a tokio runtime.
    pub(crate) fn new(
        store: Arc<dyn GraphStore>,
        crypto: Arc<dyn CryptoProvider>,
        config: FeedConfig,
        identity: LocalIdentity,
        my_secret: Secret,
        events: broadcast::Sender<HandshakeEvent>,
    ) -> Arc<Self> {
        let window = config.listener_window();
        Arc::new(Self {
            store,
            crypto,
            identity,
            my_secret,
            pair_secrets: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            events,
            address: Topic::debounced(topics::ADDRESS, None, window),
            outgoings: Topic::immediate(topics::OUTGOINGS, Outgoings::new()),
            chats: Topic::immediate(topics::CHATS, Vec::new()),
            pub_to_feed: Topic::immediate(topics::PUB_TO_FEED, PubToFeed::new()),
            user_to_incoming: Topic::debounced(topics::USER_TO_INCOMING, BTreeMap::new(), window),
            incoming_index: Topic::immediate(topics::INCOMING_INDEX, IncomingIndex::new()),
            seed_backup: Topic::debounced(topics::SEED_BACKUP, None, window),
            received_requests: Topic::debounced(topics::RECEIVED_REQUESTS, Vec::new(), window),
            sent_requests: Topic::debounced(topics::SENT_REQUESTS, Vec::new(), window),
            incoming_feeds: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Public key of the logged-in user.
    pub fn public_key(&self) -> &str {
        self.identity.public_key()
    }

    /// Root of the logged-in user's graph.
    pub fn user_path(&self) -> GraphPath {
        GraphPath::user(self.identity.public_key())
    }

    /// Encrypt with the local secret.
    pub(crate) async fn encrypt_mine(&self, plaintext: &str) -> FeedResult<String> {
        self.crypto.encrypt(plaintext, &self.my_secret).await
    }

    /// Decrypt with the local secret.
    pub(crate) async fn decrypt_mine(&self, ciphertext: &str) -> Option<String> {
        self.crypto.decrypt(ciphertext, &self.my_secret).await
    }

    /// Pairwise secret shared with `peer`, cached for the session.
    pub(crate) async fn pair_secret(&self, peer: &str) -> FeedResult<Secret> {
        if let Some(secret) = self.pair_secrets.read().get(peer) {
            return Ok(secret.clone());
        }

        let epub = self.crypto.public_key_to_encryption_key(peer).await?;
        let secret = self.crypto.derive_shared_secret(&epub, &self.identity).await?;
        debug!(peer, "Derived pairwise secret");
        self.pair_secrets
            .write()
            .insert(peer.to_string(), secret.clone());
        Ok(secret)
    }

    /// Write and classify the acknowledgment.
    pub(crate) async fn write_checked(&self, path: &GraphPath, value: serde_json::Value) -> FeedResult<()> {
        let ack = self.store.write(path, value).await;
        self.check_ack(path, ack)
    }

    fn check_ack(&self, path: &GraphPath, ack: WriteAck) -> FeedResult<()> {
        match ack.err {
            Some(err) if !self.config.ack_codes.is_ignorable(&err) => Err(FeedError::RemoteWrite {
                path: path.to_string(),
                message: err.to_string(),
            }),
            Some(err) => {
                debug!(%path, code = %err, "Ignoring benign acknowledgment code");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub(crate) fn emit(&self, event: HandshakeEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Spawn a task owned by this session.
    pub(crate) fn spawn<F>(&self, future: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let abort = handle.abort_handle();
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        abort
    }

    /// Abort every task attached to this session.
    pub(crate) fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        debug!(count = tasks.len(), "Aborting session tasks");
        for task in tasks {
            task.abort();
        }
        self.incoming_feeds.lock().clear();
    }
}
