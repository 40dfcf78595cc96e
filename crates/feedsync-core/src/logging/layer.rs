//! Custom tracing Layer that writes to a [`LogSink`].

use std::fmt::Write as FmtWrite;
use std::path::PathBuf;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::JsonLogEntry;
use super::sink::LogSink;
use crate::error::{FeedError, FeedResult};

/// A tracing Layer that turns every event into a [`JsonLogEntry`].
pub struct JsonlLayer {
    sink: LogSink,
    session: String,
}

impl JsonlLayer {
    pub fn new(sink: LogSink, session: impl Into<String>) -> Self {
        Self {
            sink,
            session: session.into(),
        }
    }

    pub fn sink(&self) -> &LogSink {
        &self.sink
    }

    pub fn session(&self) -> &str {
        &self.session
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = metadata.level().as_str().to_lowercase();

        let mut visitor = JsonVisitor::new();
        event.record(&mut visitor);

        let message = visitor.message.unwrap_or_default();
        let mut entry = JsonLogEntry::new(&level, &self.session, metadata.target(), message);

        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields));
        }

        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<String> = scope.from_root().map(|span| span.name().to_string()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // Logging must never panic or propagate
        let _ = self.sink.write(&entry);
    }
}

/// Visitor that extracts fields from tracing events.
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
        }
    }

    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);

        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, serde_json::Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

/// Builder for the process-wide tracing subscriber.
pub struct LoggingBuilder {
    session: String,
    logs_dir: Option<PathBuf>,
    sink: Option<LogSink>,
    console_output: bool,
    env_filter: Option<String>,
}

impl LoggingBuilder {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            logs_dir: None,
            sink: None,
            console_output: true,
            env_filter: None,
        }
    }

    /// Write JSONL files under `logs_dir/raw`.
    pub fn to_dir(mut self, logs_dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(logs_dir.into());
        self
    }

    /// Write JSONL entries into an existing sink.
    pub fn to_sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Disable console output.
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Set the environment filter (e.g., "feedsync_core=debug").
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Build the JSONL layer alone, if a destination was configured.
    pub fn build_layer(&self) -> FeedResult<Option<JsonlLayer>> {
        let sink = match (&self.sink, &self.logs_dir) {
            (Some(sink), _) => sink.clone(),
            (None, Some(dir)) => LogSink::file(dir, &self.session)?,
            (None, None) => return Ok(None),
        };
        Ok(Some(JsonlLayer::new(sink, self.session.clone())))
    }

    fn build_filter(&self) -> FeedResult<EnvFilter> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| FeedError::Config(format!("Invalid log filter: {}", e))),
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
        }
    }

    /// Install the subscriber globally.
    pub fn init(self) -> FeedResult<()> {
        let filter = self.build_filter()?;
        let jsonl = self.build_layer()?;
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_target(true));

        tracing_subscriber::registry()
            .with(filter)
            .with(jsonl)
            .with(console)
            .try_init()
            .map_err(|e| FeedError::Config(format!("Failed to install subscriber: {}", e)))
    }
}
