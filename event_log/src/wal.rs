use crate::{JournalCorruptSnafu, Result, StoreSnafu};
use bytes::Bytes;
use data_types::Event;
use object_store::{ObjectStore, Path};
use parking_lot::Mutex;
use snafu::ResultExt;
use std::sync::Arc;
use tracing::info;

/// Write-ahead journal for not-yet-flushed events.
///
/// Events append as JSON lines; the journal only ever holds the writer's
/// current buffer, so it is rewritten wholesale on every append and
/// truncated once a flush lands durably. On startup [`Wal::recover`]
/// replays whatever a crashed writer left behind.
#[derive(Debug)]
pub struct Wal {
    store: Arc<dyn ObjectStore>,
    path: Path,
    // mirror of the journal contents; the source of truth for rewrites
    lines: Mutex<Vec<String>>,
}

impl Wal {
    /// Open (or create) the journal at `path`.
    pub fn new(store: Arc<dyn ObjectStore>, path: Path) -> Self {
        Self {
            store,
            path,
            lines: Mutex::new(vec![]),
        }
    }

    /// Read back events left in the journal by a previous process.
    pub async fn recover(&self) -> Result<Vec<Event>> {
        let raw = match self.store.read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(vec![]),
            Err(e) => return Err(e).context(StoreSnafu),
        };

        let text = String::from_utf8_lossy(&raw);
        let mut events = vec![];
        let mut lines = vec![];
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event =
                serde_json::from_str(line).context(JournalCorruptSnafu { line: i })?;
            events.push(event);
            lines.push(line.to_string());
        }
        *self.lines.lock() = lines;
        if !events.is_empty() {
            info!(n_events = events.len(), path = %self.path, "recovered journal");
        }
        Ok(events)
    }

    /// Append one event to the journal.
    pub async fn append(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event).expect("events serialize");
        let contents = {
            let mut lines = self.lines.lock();
            lines.push(line);
            lines.join("\n")
        };
        self.store
            .write_atomic(&self.path, Bytes::from(contents))
            .await
            .context(StoreSnafu)
    }

    /// Drop the journal contents after a successful flush.
    pub async fn truncate(&self) -> Result<()> {
        self.lines.lock().clear();
        match self.store.delete(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e).context(StoreSnafu),
        }
    }
}
