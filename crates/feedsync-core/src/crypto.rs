//! Crypto provider seam and its default implementation
//!
//! The reconciliation layer only needs four operations from its crypto
//! provider: symmetric encrypt/decrypt of strings under a shared secret,
//! pairwise secret derivation, and resolution of a peer's encryption key from
//! their public key. [`CryptoProvider`] captures exactly that.
//!
//! [`SeaCrypto`] implements it with:
//! - X25519 key agreement, stretched with HKDF-SHA256 into a 32-byte secret
//! - ChaCha20-Poly1305 AEAD with a random nonce per message
//! - base64url armour with a version prefix
//!
//! ## Wire Format
//!
//! ```text
//! "fs1:" + base64url( [nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)] )
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, trace};

use crate::error::{FeedError, FeedResult};
use crate::identity::{EncryptionKey, LocalIdentity};
use crate::keys;
use crate::store::{GraphPath, GraphStore};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Prefix marking ciphertext produced by [`SeaCrypto`]
pub const CIPHERTEXT_PREFIX: &str = "fs1:";

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"feedsync-pairwise-v1";

/// A 32-byte symmetric secret shared by two identities.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Operations consumed from the crypto provider.
#[async_trait]
pub trait CryptoProvider: Send + Sync + 'static {
    /// Encrypt a string under `secret`.
    async fn encrypt(&self, plaintext: &str, secret: &Secret) -> FeedResult<String>;

    /// Decrypt a string; `None` when the ciphertext is malformed, was made
    /// under another secret, or is not UTF-8.
    async fn decrypt(&self, ciphertext: &str, secret: &Secret) -> Option<String>;

    /// Derive the secret shared between `identity` and the owner of `peer`.
    async fn derive_shared_secret(
        &self,
        peer: &EncryptionKey,
        identity: &LocalIdentity,
    ) -> FeedResult<Secret>;

    /// Resolve the encryption key published by `public_key`.
    async fn public_key_to_encryption_key(&self, public_key: &str) -> FeedResult<EncryptionKey>;
}

/// Source of published encryption keys.
#[async_trait]
pub trait KeyDirectory: Send + Sync + 'static {
    async fn lookup(&self, public_key: &str) -> FeedResult<Option<EncryptionKey>>;
}

/// [`KeyDirectory`] reading `~<pub>/epub` from the graph store.
pub struct StoreKeyDirectory {
    store: Arc<dyn GraphStore>,
}

impl StoreKeyDirectory {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl KeyDirectory for StoreKeyDirectory {
    async fn lookup(&self, public_key: &str) -> FeedResult<Option<EncryptionKey>> {
        let path = GraphPath::user(public_key).child(keys::EPUB);
        match self.store.once(&path).await? {
            Some(serde_json::Value::String(epub)) if !epub.is_empty() => {
                Ok(Some(EncryptionKey::new(epub)))
            }
            _ => Ok(None),
        }
    }
}

/// ChaCha20-Poly1305 cipher bound to one secret.
pub struct FeedCipher {
    cipher: ChaCha20Poly1305,
}

impl FeedCipher {
    pub fn new(secret: &Secret) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(secret.as_bytes().into()),
        }
    }

    /// Encrypt with a fresh random nonce.
    ///
    /// Output format: `[nonce (12 bytes)] + [ciphertext + tag]`
    pub fn encrypt(&self, plaintext: &[u8]) -> FeedResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| FeedError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt `[nonce] + [ciphertext + tag]`.
    pub fn decrypt(&self, data: &[u8]) -> FeedResult<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return Err(FeedError::Decryption(
                "Data too short to contain nonce".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|e| FeedError::Decryption(format!("{}", e)))
    }
}

/// Default [`CryptoProvider`]: X25519 + HKDF + ChaCha20-Poly1305.
pub struct SeaCrypto {
    directory: Arc<dyn KeyDirectory>,
    /// public key -> encryption key
    cache: RwLock<HashMap<String, EncryptionKey>>,
}

impl SeaCrypto {
    pub fn new(directory: Arc<dyn KeyDirectory>) -> Self {
        Self {
            directory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Provider resolving keys from `~<pub>/epub` in `store`.
    pub fn with_store(store: Arc<dyn GraphStore>) -> Self {
        Self::new(Arc::new(StoreKeyDirectory::new(store)))
    }
}

#[async_trait]
impl CryptoProvider for SeaCrypto {
    async fn encrypt(&self, plaintext: &str, secret: &Secret) -> FeedResult<String> {
        let sealed = FeedCipher::new(secret).encrypt(plaintext.as_bytes())?;
        Ok(format!(
            "{}{}",
            CIPHERTEXT_PREFIX,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sealed)
        ))
    }

    async fn decrypt(&self, ciphertext: &str, secret: &Secret) -> Option<String> {
        let encoded = ciphertext.strip_prefix(CIPHERTEXT_PREFIX)?;
        let sealed = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()?;
        match FeedCipher::new(secret).decrypt(&sealed) {
            Ok(plain) => String::from_utf8(plain).ok(),
            Err(e) => {
                trace!(error = %e, "Ciphertext did not open under the given secret");
                None
            }
        }
    }

    async fn derive_shared_secret(
        &self,
        peer: &EncryptionKey,
        identity: &LocalIdentity,
    ) -> FeedResult<Secret> {
        let peer_public = peer.to_x25519()?;
        let shared = identity.x25519_secret().diffie_hellman(&peer_public);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(HKDF_INFO, &mut okm)
            .map_err(|e| FeedError::Crypto(format!("HKDF expand failed: {}", e)))?;
        Ok(Secret(okm))
    }

    async fn public_key_to_encryption_key(&self, public_key: &str) -> FeedResult<EncryptionKey> {
        if let Some(cached) = self.cache.read().get(public_key) {
            return Ok(cached.clone());
        }

        let epub = self.directory.lookup(public_key).await?.ok_or_else(|| {
            FeedError::Crypto(format!("No encryption key published for {}", public_key))
        })?;

        debug!(public_key, "Resolved encryption key");
        self.cache
            .write()
            .insert(public_key.to_string(), epub.clone());
        Ok(epub)
    }
}
