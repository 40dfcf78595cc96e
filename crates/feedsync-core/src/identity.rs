//! Local identity key material
//!
//! A [`LocalIdentity`] is built from an Ed25519 seed. The verifying key is
//! the user's public key string in the graph, and an X25519 key is kept for
//! pairwise secret derivation. The X25519 key is derived deterministically from
//! the signing seed, so the same seed always yields the same encryption key.
//!
//! Public keys are rendered as base58 strings.
//!
//! ```
//! use feedsync_core::identity::LocalIdentity;
//!
//! let alice = LocalIdentity::from_seed(&[7u8; 32]);
//! let again = LocalIdentity::from_seed(&[7u8; 32]);
//! assert_eq!(alice.public_key(), again.public_key());
//! assert_eq!(alice.encryption_key(), again.encryption_key());
//! ```

use std::fmt;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::{FeedError, FeedResult};

/// Domain separation for deriving the X25519 seed from the signing seed
const X25519_SEED_CONTEXT: &str = "feedsync-x25519-seed-v1";

/// A peer's encryption public key (base58 X25519 public key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode into an X25519 public key.
    pub fn to_x25519(&self) -> FeedResult<X25519PublicKey> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| FeedError::Crypto(format!("Invalid encryption key encoding: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FeedError::Crypto("Encryption key must be 32 bytes".to_string()))?;
        Ok(X25519PublicKey::from(bytes))
    }
}

impl fmt::Display for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The authenticated user's key material.
#[derive(Clone)]
pub struct LocalIdentity {
    x25519_secret: X25519StaticSecret,
    public_key: String,
    encryption_key: EncryptionKey,
}

impl LocalIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> FeedResult<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| FeedError::Crypto(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self::from_seed(&seed))
    }

    /// Build an identity deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        let x25519_seed = blake3::derive_key(X25519_SEED_CONTEXT, signing.as_bytes());
        let x25519_secret = X25519StaticSecret::from(x25519_seed);

        let public_key = bs58::encode(signing.verifying_key().as_bytes()).into_string();
        let encryption_key = EncryptionKey(
            bs58::encode(X25519PublicKey::from(&x25519_secret).as_bytes()).into_string(),
        );

        Self {
            x25519_secret,
            public_key,
            encryption_key,
        }
    }

    /// The user's public key, as used to key their graph namespace.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The user's encryption public key.
    pub fn encryption_key(&self) -> &EncryptionKey {
        &self.encryption_key
    }

    pub(crate) fn x25519_secret(&self) -> &X25519StaticSecret {
        &self.x25519_secret
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("public_key", &self.public_key)
            .field("encryption_key", &self.encryption_key)
            .finish_non_exhaustive()
    }
}
