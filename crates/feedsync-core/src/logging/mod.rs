//! Structured JSONL logging for reconciliation sessions.
//!
//! Every `tracing` event emitted by the crate can be captured as one
//! self-contained JSON object per line, so protocol runs can be inspected
//! after the fact without parsing console output.
//!
//! ## Usage
//!
//! ```ignore
//! use feedsync_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("alice")
//!     .to_dir("./logs")
//!     .with_filter("feedsync_core=debug")
//!     .init()?;
//! ```
//!
//! Tests capture entries in memory instead:
//!
//! ```
//! use feedsync_core::logging::{JsonlLayer, LogSink};
//! use tracing_subscriber::prelude::*;
//!
//! let sink = LogSink::memory();
//! let subscriber = tracing_subscriber::registry().with(JsonlLayer::new(sink.clone(), "test"));
//! tracing::subscriber::with_default(subscriber, || tracing::warn!(peer = "pubA", "skipped"));
//!
//! let entries = sink.entries();
//! assert_eq!(entries[0].level, "warn");
//! ```
//!
//! ### Querying logs with jq
//!
//! ```bash
//! # Every protocol failure
//! jq 'select(.level == "error")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod sink;

pub use entry::JsonLogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use sink::LogSink;
