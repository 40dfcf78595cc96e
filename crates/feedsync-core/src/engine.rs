//! The public entry point.
//!
//! [`FeedEngine`] owns the collaborators (graph store, crypto provider,
//! config) and at most one authenticated session. Every subscription and
//! getter fails with [`FeedError::NotAuthenticated`] until
//! [`FeedEngine::login`] succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::chats::{self, Chat};
use crate::config::FeedConfig;
use crate::crypto::{CryptoProvider, SeaCrypto};
use crate::error::{FeedError, FeedResult};
use crate::handshake::{self, HandshakeEvent};
use crate::identity::LocalIdentity;
use crate::incoming::{self, IncomingMessages};
use crate::keys;
use crate::outgoing::{self, Outgoings};
use crate::requests::{self, SimpleReceivedRequest, SimpleSentRequest};
use crate::session::SessionContext;
use crate::store::GraphStore;
use crate::subscription::{Listener, Subscription};
use crate::{address, seed};

/// Capacity of the handshake event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct FeedEngine {
    store: Arc<dyn GraphStore>,
    crypto: Arc<dyn CryptoProvider>,
    config: FeedConfig,
    session: RwLock<Option<Arc<SessionContext>>>,
    /// Outlives sessions so receivers survive a re-login
    event_tx: broadcast::Sender<HandshakeEvent>,
}

impl FeedEngine {
    /// Create an engine over `store`, resolving keys with [`SeaCrypto`].
    pub fn new(store: Arc<dyn GraphStore>, config: FeedConfig) -> FeedResult<Self> {
        let crypto = Arc::new(SeaCrypto::with_store(store.clone()));
        Self::with_crypto(store, crypto, config)
    }

    /// Create an engine with a custom crypto provider.
    pub fn with_crypto(
        store: Arc<dyn GraphStore>,
        crypto: Arc<dyn CryptoProvider>,
        config: FeedConfig,
    ) -> FeedResult<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            crypto,
            config,
            session: RwLock::new(None),
            event_tx,
        })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Start a session for `identity`.
    ///
    /// Publishes the identity's encryption key at `~<pub>/epub`, derives the
    /// local secret and starts the handshake acceptance job. Any previous
    /// session is ended first.
    pub async fn login(&self, identity: LocalIdentity) -> FeedResult<()> {
        self.logout();

        let epub_path = crate::store::GraphPath::user(identity.public_key()).child(keys::EPUB);
        let ack = self
            .store
            .write(&epub_path, Value::String(identity.encryption_key().to_string()))
            .await;
        if let Some(err) = ack.err {
            if !self.config.ack_codes.is_ignorable(&err) {
                return Err(FeedError::RemoteWrite {
                    path: epub_path.to_string(),
                    message: err.to_string(),
                });
            }
        }

        let my_secret = self
            .crypto
            .derive_shared_secret(identity.encryption_key(), &identity)
            .await?;

        info!(user = %identity.public_key(), "Session started");
        let session = SessionContext::new(
            self.store.clone(),
            self.crypto.clone(),
            self.config.clone(),
            identity,
            my_secret,
            self.event_tx.clone(),
        );
        handshake::start(&session);
        *self.session.write() = Some(session);
        Ok(())
    }

    /// End the current session, if any. In-flight store writes are not undone.
    pub fn logout(&self) {
        if let Some(session) = self.session.write().take() {
            info!(user = %session.public_key(), "Session ended");
            session.shutdown();
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.read().is_some()
    }

    /// Public key of the logged-in user.
    pub fn public_key(&self) -> FeedResult<String> {
        Ok(self.session()?.public_key().to_string())
    }

    fn session(&self) -> FeedResult<Arc<SessionContext>> {
        self.session
            .read()
            .clone()
            .ok_or(FeedError::NotAuthenticated)
    }

    /// Receive handshake protocol events. Works before login.
    pub fn subscribe_events(&self) -> broadcast::Receiver<HandshakeEvent> {
        self.event_tx.subscribe()
    }

    pub fn on_current_handshake_address(&self, listener: Listener<Option<String>>) -> FeedResult<Subscription> {
        address::on_current_handshake_address(&self.session()?, listener)
    }

    pub fn current_handshake_address(&self) -> FeedResult<Option<String>> {
        let session = self.session()?;
        address::attach(&session);
        Ok(session.address.current())
    }

    /// Decrypted messages `peer` writes for us in `feed_id`.
    pub fn on_incoming_messages(
        &self,
        peer: &str,
        feed_id: &str,
        listener: Listener<IncomingMessages>,
    ) -> FeedResult<Subscription> {
        incoming::on_incoming_messages(&self.session()?, peer, feed_id, listener)
    }

    /// Peers we are connected to and the id of the feed each writes for us.
    pub fn on_user_to_incoming(&self, listener: Listener<BTreeMap<String, String>>) -> FeedResult<Subscription> {
        incoming::on_user_to_incoming(&self.session()?, listener)
    }

    pub fn on_outgoing(&self, listener: Listener<Outgoings>) -> FeedResult<Subscription> {
        outgoing::on_outgoing(&self.session()?, listener)
    }

    pub fn current_outgoings(&self) -> FeedResult<Outgoings> {
        let session = self.session()?;
        outgoing::attach(&session);
        Ok(session.outgoings.current())
    }

    pub fn on_chats(&self, listener: Listener<Vec<Chat>>) -> FeedResult<Subscription> {
        chats::on_chats(&self.session()?, listener)
    }

    pub fn chats(&self) -> FeedResult<Vec<Chat>> {
        let session = self.session()?;
        chats::attach(&session)?;
        Ok(session.chats.current())
    }

    pub fn on_received_requests(&self, listener: Listener<Vec<SimpleReceivedRequest>>) -> FeedResult<Subscription> {
        requests::on_received_requests(&self.session()?, listener)
    }

    pub fn received_requests(&self) -> FeedResult<Vec<SimpleReceivedRequest>> {
        let session = self.session()?;
        requests::attach_received(&session)?;
        Ok(session.received_requests.current())
    }

    pub fn on_sent_requests(&self, listener: Listener<Vec<SimpleSentRequest>>) -> FeedResult<Subscription> {
        requests::on_sent_requests(&self.session()?, listener)
    }

    pub fn sent_requests(&self) -> FeedResult<Vec<SimpleSentRequest>> {
        let session = self.session()?;
        requests::attach_sent(&session);
        Ok(session.sent_requests.current())
    }

    pub fn on_seed_backup(&self, listener: Listener<Option<String>>) -> FeedResult<Subscription> {
        seed::on_seed_backup(&self.session()?, listener)
    }

    pub fn seed_backup(&self) -> FeedResult<Option<String>> {
        let session = self.session()?;
        seed::attach(&session);
        Ok(session.seed_backup.current())
    }

    /// Whether both `userToIncoming` and `recipientToOutgoing` hold a
    /// decryptable entry for `peer`.
    pub async fn successful_handshake_exists(&self, peer: &str) -> FeedResult<bool> {
        let session = self.session()?;
        handshake::successful_handshake_exists(&session, peer).await
    }

    /// Id of the latest request sent to `peer`.
    pub async fn last_request_sent_id(&self, peer: &str) -> FeedResult<Option<String>> {
        let session = self.session()?;
        handshake::last_request_sent_id(&session, peer).await
    }

    /// Encrypt `plaintext` with the local secret.
    pub async fn encrypt_for_self(&self, plaintext: &str) -> FeedResult<String> {
        self.session()?.encrypt_mine(plaintext).await
    }

    /// Encrypt `plaintext` with the secret shared with `peer`.
    pub async fn encrypt_for_peer(&self, peer: &str, plaintext: &str) -> FeedResult<String> {
        let session = self.session()?;
        let secret = session.pair_secret(peer).await?;
        self.crypto.encrypt(plaintext, &secret).await
    }
}

impl Drop for FeedEngine {
    fn drop(&mut self) {
        self.logout();
    }
}
