use crate::{BatchEventSource, EventWriter, Result};
use data_types::{sort_for_replay, EntityId, Event, EventOp};
use std::collections::HashSet;
use std::sync::Arc;

/// The query surface of the event log.
///
/// Writes delegate to the [`EventWriter`]; reads merge the writer's
/// in-memory buffer with the durable batches so a reader always observes
/// its own un-flushed appends.
#[derive(Debug)]
pub struct EventLog {
    writer: Arc<EventWriter>,
    source: BatchEventSource,
}

impl EventLog {
    /// Build over an existing writer and batch source.
    pub fn new(writer: Arc<EventWriter>, source: BatchEventSource) -> Self {
        Self { writer, source }
    }

    /// The underlying writer.
    pub fn writer(&self) -> &Arc<EventWriter> {
        &self.writer
    }

    /// The underlying batch source.
    pub fn source(&self) -> &BatchEventSource {
        &self.source
    }

    /// Append one event.
    pub async fn append(&self, event: Event) -> Result<()> {
        self.writer.append(event).await
    }

    /// Append many events.
    pub async fn append_many(&self, events: Vec<Event>) -> Result<()> {
        self.writer.append_many(events).await
    }

    /// Force buffered events into a durable batch.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    /// All events of one entity within `[min_ts, max_ts]`, replay-ordered.
    pub async fn get_events(
        &self,
        entity: &EntityId,
        min_ts: Option<i64>,
        max_ts: Option<i64>,
    ) -> Result<Vec<Event>> {
        let target = entity.event_target();
        let mut events = self.merged_range(min_ts, max_ts).await?;
        events.retain(|e| e.target == target);
        Ok(events)
    }

    /// All events within `[min_ts, max_ts]`, replay-ordered.
    pub async fn get_events_in_range(
        &self,
        min_ts: Option<i64>,
        max_ts: Option<i64>,
    ) -> Result<Vec<Event>> {
        self.merged_range(min_ts, max_ts).await
    }

    /// All events of one operation kind, replay-ordered.
    pub async fn get_events_by_op(&self, op: EventOp) -> Result<Vec<Event>> {
        let mut events = self.merged_range(None, None).await?;
        events.retain(|e| e.op == op);
        Ok(events)
    }

    /// The complete ordered history of one entity, ready for replay.
    pub async fn get_history(&self, entity: &EntityId) -> Result<Vec<Event>> {
        self.get_events(entity, None, None).await
    }

    async fn merged_range(
        &self,
        min_ts: Option<i64>,
        max_ts: Option<i64>,
    ) -> Result<Vec<Event>> {
        let mut events = self.source.read_range(min_ts, max_ts).await?;

        // a flush may be mid-flight; de-dup by id when merging the buffer
        let mut seen: HashSet<String> =
            events.iter().map(|e| e.id.as_str().to_string()).collect();
        for event in self.writer.buffered_events() {
            let in_range = min_ts.map(|m| event.ts >= m).unwrap_or(true)
                && max_ts.map(|m| event.ts <= m).unwrap_or(true);
            if in_range && seen.insert(event.id.as_str().to_string()) {
                events.push(event);
            }
        }
        sort_for_replay(&mut events);
        Ok(events)
    }
}
