//! Error types for the reconciliation layer

use thiserror::Error;

/// Main error type for feedsync operations
#[derive(Error, Debug)]
pub enum FeedError {
    /// A subscription or getter was used before `login`
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The same listener instance was registered twice on a topic
    #[error("Listener already subscribed to {0}")]
    AlreadySubscribed(String),

    /// A listener was removed from a topic it is not registered on
    #[error("Listener not subscribed to {0}")]
    NotSubscribed(String),

    /// A store payload did not match the expected shape
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Decryption yielded no usable plaintext
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// The store acknowledged a write with a real (non-ignorable) error
    #[error("Remote write failed at {path}: {message}")]
    RemoteWrite {
        /// Path that was written
        path: String,
        /// Error carried by the acknowledgment
        message: String,
    },

    /// A peer's feed never became visible after every retry
    #[error("Feed not visible after {attempts} attempts: {feed_id}")]
    FeedNotVisible {
        /// Feed id that was polled
        feed_id: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Graph store operation failed
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using FeedError
pub type FeedResult<T> = Result<T, FeedError>;
