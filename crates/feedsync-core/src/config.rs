//! Runtime configuration for the reconciliation layer
//!
//! Every knob has a default matching the behaviour the graph store was tuned
//! for, so `FeedConfig::default()` is a working configuration. Configs can also
//! be loaded from JSON, with missing fields falling back to their defaults:
//!
//! ```
//! use feedsync_core::config::FeedConfig;
//!
//! let config = FeedConfig::from_json(r#"{ "chats_debounce_ms": 1000 }"#).unwrap();
//! assert_eq!(config.chats_debounce_ms, 1000);
//! assert_eq!(config.listener_debounce_ms, 500);
//! ```

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};
use crate::store::AckError;

/// Debounce window for listener fan-out paths.
pub const DEFAULT_LISTENER_DEBOUNCE_MS: u64 = 500;

/// Debounce window for raw outgoing snapshot decryption.
pub const DEFAULT_OUTGOING_DEBOUNCE_MS: u64 = 400;

/// Debounce window for chat recomputation.
pub const DEFAULT_CHATS_DEBOUNCE_MS: u64 = 750;

/// Configuration for a feedsync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Trailing-edge window for per-topic listener fan-out
    pub listener_debounce_ms: u64,
    /// Trailing-edge window applied to raw outgoing snapshots before decryption
    pub outgoing_debounce_ms: u64,
    /// Trailing-edge window for chat recomputation
    pub chats_debounce_ms: u64,
    /// Retry policy used while waiting for a peer's feed to appear
    pub feed_retry: RetryPolicy,
    /// Which acknowledgment error codes are benign
    pub ack_codes: AckCodePolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            listener_debounce_ms: DEFAULT_LISTENER_DEBOUNCE_MS,
            outgoing_debounce_ms: DEFAULT_OUTGOING_DEBOUNCE_MS,
            chats_debounce_ms: DEFAULT_CHATS_DEBOUNCE_MS,
            feed_retry: RetryPolicy::default(),
            ack_codes: AckCodePolicy::default(),
        }
    }
}

impl FeedConfig {
    /// Parse a config from JSON text and validate it.
    pub fn from_json(json: &str) -> FeedResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> FeedResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> FeedResult<()> {
        if self.listener_debounce_ms == 0 {
            return Err(FeedError::Config(
                "listener_debounce_ms must be greater than zero".to_string(),
            ));
        }
        if self.chats_debounce_ms == 0 {
            return Err(FeedError::Config(
                "chats_debounce_ms must be greater than zero".to_string(),
            ));
        }
        self.feed_retry.validate()
    }

    pub fn listener_window(&self) -> Duration {
        Duration::from_millis(self.listener_debounce_ms)
    }

    pub fn outgoing_window(&self) -> Duration {
        Duration::from_millis(self.outgoing_debounce_ms)
    }

    pub fn chats_window(&self) -> Duration {
        Duration::from_millis(self.chats_debounce_ms)
    }
}

/// Bounded retry with doubling backoff.
///
/// Delays run `base, 2*base, 4*base, ...` capped at `max_delay_ms`. The first
/// attempt happens immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> FeedResult<()> {
        if self.max_attempts == 0 {
            return Err(FeedError::Config(
                "feed_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Classifies acknowledgment errors returned by the graph store.
///
/// The store reports benign conditions with numeric codes and real failures
/// with messages. Which numeric codes are benign is store-specific, so it is
/// configured here instead of hard-coded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode", content = "codes")]
pub enum AckCodePolicy {
    /// Every numeric code is benign
    #[default]
    AnyNumeric,
    /// Only the listed numeric codes are benign
    Only(BTreeSet<i64>),
}

impl AckCodePolicy {
    /// Whether an acknowledgment error may be ignored.
    pub fn is_ignorable(&self, err: &AckError) -> bool {
        match (self, err) {
            (_, AckError::Message(_)) => false,
            (AckCodePolicy::AnyNumeric, AckError::Code(_)) => true,
            (AckCodePolicy::Only(codes), AckError::Code(code)) => codes.contains(code),
        }
    }
}
