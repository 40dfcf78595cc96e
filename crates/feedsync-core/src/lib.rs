//! Feedsync Core Library
//!
//! Reconciliation layer between an encrypted, replicated graph store and a
//! messaging application.
//!
//! ## Overview
//!
//! The graph store pushes raw, per-field notifications that may repeat,
//! arrive out of order, or describe half-finished writes. This crate turns
//! that stream into coherent snapshots: decrypted message feeds, resolved
//! contact handshakes and consolidated chats.
//!
//! ```text
//! GraphStore ──► address / incoming / outgoing ──► chats ──► Topic ──► listeners
//!     ▲
//!     └──────── handshake acceptance (writes userToIncoming, retires requests)
//! ```
//!
//! ## Core Principles
//!
//! - **Replay-safe**: every handler is idempotent on re-delivery
//! - **Latest wins**: debounced topics collapse bursts to the newest snapshot
//! - **Contained failures**: a bad entry or a failed run never reaches a listener
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use feedsync_core::{listener, FeedConfig, FeedEngine, LocalIdentity, MemoryGraph};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryGraph::new());
//!     let engine = FeedEngine::new(store, FeedConfig::default())?;
//!     engine.login(LocalIdentity::generate()?).await?;
//!
//!     let chats = engine.on_chats(listener(|chats: &Vec<feedsync_core::Chat>| {
//!         println!("{} chats", chats.len());
//!     }))?;
//!
//!     // ...
//!     chats.unsubscribe()?;
//!     Ok(())
//! }
//! ```

mod address;
pub mod chats;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod identity;
mod incoming;
pub mod keys;
pub mod logging;
pub mod outgoing;
pub mod requests;
pub mod retry;
pub mod schema;
mod seed;
mod session;
pub mod store;
pub mod subscription;

// Re-exports
pub use chats::{derive_chats, Chat, ChatMessage, FeedState, PubToFeed};
pub use config::{AckCodePolicy, FeedConfig, RetryPolicy};
pub use crypto::{CryptoProvider, KeyDirectory, SeaCrypto, Secret, StoreKeyDirectory};
pub use engine::FeedEngine;
pub use error::{FeedError, FeedResult};
pub use handshake::{DiscardReason, HandshakeEvent, HandshakeOutcome};
pub use identity::{EncryptionKey, LocalIdentity};
pub use incoming::{IncomingIndex, IncomingMessages};
pub use outgoing::{Outgoing, OutgoingMessage, Outgoings};
pub use requests::{SimpleReceivedRequest, SimpleSentRequest};
pub use schema::Message;
pub use store::{AckError, GraphPath, GraphStore, MemoryGraph, WriteAck};
pub use subscription::{listener, Listener, Subscription, Topic};
