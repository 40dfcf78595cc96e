//! Destinations for JSONL log entries.
//!
//! A file sink appends to `<logs_dir>/raw/<date>_<session>.jsonl`, one
//! session per file so concurrent sessions never interleave lines. The memory
//! sink keeps entries in a vector for assertions in tests.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::entry::JsonLogEntry;

enum SinkInner {
    File {
        path: PathBuf,
        writer: Mutex<BufWriter<File>>,
    },
    Memory(Mutex<Vec<JsonLogEntry>>),
}

/// Shared handle to a log destination.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    /// Open (or create) the JSONL file for `session` under `logs_dir/raw`.
    pub fn file(logs_dir: impl AsRef<Path>, session: &str) -> std::io::Result<Self> {
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, session));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            inner: Arc::new(SinkInner::File {
                path,
                writer: Mutex::new(BufWriter::new(file)),
            }),
        })
    }

    /// In-memory capture.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(SinkInner::Memory(Mutex::new(Vec::new()))),
        }
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        match &*self.inner {
            SinkInner::File { path, .. } => Some(path),
            SinkInner::Memory(_) => None,
        }
    }

    /// Append one entry.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        match &*self.inner {
            SinkInner::File { writer, .. } => {
                let json = entry
                    .to_json_line()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                let mut writer = writer.lock();
                writeln!(writer, "{}", json)?;
                writer.flush()
            }
            SinkInner::Memory(entries) => {
                entries.lock().push(entry.clone());
                Ok(())
            }
        }
    }

    /// Entries written so far. File sinks are read back from disk.
    pub fn entries(&self) -> Vec<JsonLogEntry> {
        match &*self.inner {
            SinkInner::File { path, .. } => fs::read_to_string(path)
                .map(|content| {
                    content
                        .lines()
                        .filter(|line| !line.trim().is_empty())
                        .filter_map(|line| JsonLogEntry::from_json_line(line).ok())
                        .collect()
                })
                .unwrap_or_default(),
            SinkInner::Memory(entries) => entries.lock().clone(),
        }
    }
}
