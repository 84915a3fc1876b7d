use crate::{wal::Wal, CodecSnafu, Error, ObserverSnafu, Result, StoreSnafu};
use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use columnar::ColumnarCodec;
use data_types::{sort_for_replay, Event};
use db_time::{Time, TimeProvider};
use futures::future::join_all;
use object_store::{ObjectStore, Path};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Flush trigger thresholds and cadence of the [`EventWriter`].
///
/// Note that the byte figure is an estimate over the events' JSON size; it
/// only needs to keep batches in the right ballpark, not be exact.
#[derive(Debug, Clone, Copy)]
pub struct EventWriterConfig {
    /// Flush once this many events are buffered.
    pub max_buffer_size: usize,
    /// Flush once the buffered byte estimate crosses this.
    pub max_buffer_bytes: usize,
    /// Cadence of the background flusher.
    pub flush_interval: Duration,
}

impl Default for EventWriterConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 1_000,
            max_buffer_bytes: 4 * 1024 * 1024,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Observer invoked with every flushed batch.
///
/// Observers run concurrently with the batch write; a failing observer
/// fails the flush, and the writer restores its buffer so no event is
/// lost.
#[async_trait]
pub trait FlushObserver: Debug + Send + Sync + 'static {
    /// Called once per flush with the batch in `(ts, id)` order.
    async fn on_flush(
        &self,
        events: &[Event],
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Counters the writer maintains across its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Events flushed durably so far.
    pub total_events_written: u64,
    /// Completed flushes (no-op flushes do not count).
    pub total_flushes: u64,
    /// Completion time of the last flush.
    pub last_flush_at: Option<Time>,
}

#[derive(Debug, Default)]
struct BufferState {
    events: Vec<Event>,
    bytes: usize,
}

/// Buffers events and turns them into columnar batches under
/// `events/<Y>/<M>/<D>/<H>/batch-<ts>.parquet`.
///
/// Flushes trigger on buffered count, buffered bytes, the background
/// interval, or an explicit [`flush`](Self::flush)/[`close`](Self::close).
/// Concurrent flushes serialize: the second one awaits the first, then
/// observes an empty buffer and no-ops.
#[derive(Debug)]
pub struct EventWriter {
    config: EventWriterConfig,
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn ColumnarCodec>,
    time_provider: Arc<dyn TimeProvider>,
    wal: Option<Wal>,

    buffer: Mutex<BufferState>,
    // serializes whole flushes, not just buffer access
    flush_lock: tokio::sync::Mutex<()>,
    observers: RwLock<Vec<Arc<dyn FlushObserver>>>,
    stats: Mutex<WriterStats>,
}

impl EventWriter {
    /// Create a writer without a journal.
    pub fn new(
        config: EventWriterConfig,
        store: Arc<dyn ObjectStore>,
        codec: Arc<dyn ColumnarCodec>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            store,
            codec,
            time_provider,
            wal: None,
            buffer: Mutex::new(BufferState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            observers: RwLock::new(vec![]),
            stats: Mutex::new(WriterStats::default()),
        }
    }

    /// Create a writer journaling un-flushed events to `wal`, recovering
    /// whatever a previous process left there.
    pub async fn with_wal(
        config: EventWriterConfig,
        store: Arc<dyn ObjectStore>,
        codec: Arc<dyn ColumnarCodec>,
        time_provider: Arc<dyn TimeProvider>,
        wal: Wal,
    ) -> Result<Self> {
        let recovered = wal.recover().await?;
        let writer = Self {
            wal: Some(wal),
            ..Self::new(config, store, codec, time_provider)
        };
        if !recovered.is_empty() {
            let mut buffer = writer.buffer.lock();
            buffer.bytes = recovered.iter().map(estimate_bytes).sum();
            buffer.events = recovered;
        }
        Ok(writer)
    }

    /// Register a flush observer.
    pub fn on_flush(&self, observer: Arc<dyn FlushObserver>) {
        self.observers.write().push(observer);
    }

    /// Current counters.
    pub fn stats(&self) -> WriterStats {
        *self.stats.lock()
    }

    /// Number of buffered, not yet durable events.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().events.len()
    }

    /// Snapshot of the buffered events, for read paths that must see
    /// writes before they become durable.
    pub fn buffered_events(&self) -> Vec<Event> {
        self.buffer.lock().events.clone()
    }

    /// Buffer one event, flushing if a threshold is crossed.
    pub async fn append(&self, event: Event) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.append(&event).await?;
        }
        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.bytes += estimate_bytes(&event);
            buffer.events.push(event);
            buffer.events.len() >= self.config.max_buffer_size
                || buffer.bytes >= self.config.max_buffer_bytes
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Buffer many events, flushing if a threshold is crossed.
    pub async fn append_many(&self, events: Vec<Event>) -> Result<()> {
        for event in events {
            self.append(event).await?;
        }
        Ok(())
    }

    /// Flush the buffer into a columnar batch.
    ///
    /// An empty buffer is a successful no-op. On failure (store write or
    /// observer) the buffer is restored exactly as it was.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;

        let mut batch = {
            let mut buffer = self.buffer.lock();
            buffer.bytes = 0;
            std::mem::take(&mut buffer.events)
        };
        if batch.is_empty() {
            return Ok(());
        }
        sort_for_replay(&mut batch);

        let result = self.emit(&batch).await;
        match result {
            Ok(path) => {
                if let Some(wal) = &self.wal {
                    wal.truncate().await?;
                }
                let now = self.time_provider.now();
                let mut stats = self.stats.lock();
                stats.total_events_written += batch.len() as u64;
                stats.total_flushes += 1;
                stats.last_flush_at = Some(now);
                info!(n_events = batch.len(), path = %path, "flushed event batch");
                Ok(())
            }
            Err(e) => {
                // restore: the failed batch goes back in front of anything
                // appended while we were flushing
                let mut buffer = self.buffer.lock();
                let appended = std::mem::take(&mut buffer.events);
                batch.extend(appended);
                buffer.bytes = batch.iter().map(estimate_bytes).sum();
                buffer.events = batch;
                error!(error = %e, "flush failed, buffer restored");
                Err(e)
            }
        }
    }

    /// Flush and drop the writer's remaining state.
    pub async fn close(&self) -> Result<()> {
        self.flush().await
    }

    async fn emit(&self, batch: &[Event]) -> Result<Path> {
        let encoded = self.codec.encode_events(batch).context(CodecSnafu)?;
        let path = self.batch_path();

        let write = async {
            self.store
                .write_atomic(&path, encoded.bytes.clone())
                .await
                .context(StoreSnafu)
        };
        let observers: Vec<_> = self.observers.read().clone();
        let notify = async {
            let results = join_all(observers.iter().map(|o| o.on_flush(batch))).await;
            for result in results {
                result.context(ObserverSnafu)?;
            }
            Ok::<(), Error>(())
        };

        // the batch write and the observer fan-out run concurrently
        let (write_result, notify_result) = futures::join!(write, notify);

        if let Err(e) = write_result.and(notify_result) {
            // roll the half-landed batch back so a restored buffer cannot
            // duplicate events on the next flush
            if let Err(cleanup) = self.store.delete(&path).await {
                if !cleanup.is_not_found() {
                    error!(error = %cleanup, path = %path, "failed to remove partial batch");
                }
            }
            return Err(e);
        }
        Ok(path)
    }

    fn batch_path(&self) -> Path {
        let now = self.time_provider.now();
        let ms = now.timestamp_millis();
        let dt = Utc.timestamp_millis_opt(ms).single().expect("valid time");
        Path::parse(format!(
            "events/{:04}/{:02}/{:02}/{:02}/batch-{}.parquet",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            ms,
        ))
        .expect("generated batch paths are valid")
    }
}

fn estimate_bytes(event: &Event) -> usize {
    serde_json::to_string(event).map(|s| s.len()).unwrap_or(0)
}

/// Drive periodic flushes until `shutdown` fires; a final flush runs on
/// the way out.
pub async fn run_flusher(writer: Arc<EventWriter>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(writer.config.flush_interval) => {},
            _ = shutdown.cancelled() => {
                if let Err(e) = writer.close().await {
                    error!(error = %e, "final flush failed on shutdown");
                }
                info!("event flusher shutdown");
                return;
            }
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "periodic flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use columnar::ParquetCodec;
    use data_types::{doc, EntityId, EventOp};
    use db_time::{MockProvider, SystemProvider};
    use object_store::InMemory;
    use parking_lot::Mutex as PlMutex;

    fn event(ts: i64, title: &str) -> Event {
        let id = EntityId::new("posts", "p1").unwrap();
        let mut e = Event::new(EventOp::Update, &id, ts);
        e.after = Some(doc! {"title" => title});
        e
    }

    fn writer_with(
        config: EventWriterConfig,
    ) -> (Arc<dyn ObjectStore>, Arc<MockProvider>, EventWriter) {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let writer = EventWriter::new(
            config,
            Arc::clone(&store),
            Arc::new(ParquetCodec::new()),
            Arc::clone(&time_provider) as _,
        );
        (store, time_provider, writer)
    }

    #[derive(Debug, Default)]
    struct RecordingObserver {
        batches: PlMutex<Vec<Vec<Event>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl FlushObserver for RecordingObserver {
        async fn on_flush(
            &self,
            events: &[Event],
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err("observer unhappy".into());
            }
            self.batches.lock().push(events.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_writes_batch_and_updates_stats() {
        let (store, time_provider, writer) = writer_with(EventWriterConfig::default());
        time_provider.set(Time::from_timestamp_millis(1_658_000_000_000));

        writer.append(event(1_000, "a")).await.unwrap();
        writer.append(event(2_000, "b")).await.unwrap();
        assert_eq!(writer.buffered(), 2);

        writer.flush().await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let stats = writer.stats();
        assert_eq!(stats.total_events_written, 2);
        assert_eq!(stats.total_flushes, 1);
        assert!(stats.last_flush_at.is_some());

        // the batch landed in the hourly partition
        let files = store
            .list_all(&Path::parse("events").unwrap())
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.as_str().starts_with("events/2022/07/"));
        assert!(files[0].path.file_name().starts_with("batch-"));
    }

    #[tokio::test]
    async fn empty_flush_is_a_no_op() {
        let (_store, _tp, writer) = writer_with(EventWriterConfig::default());
        writer.flush().await.unwrap();
        assert_eq!(writer.stats().total_flushes, 0);
    }

    #[tokio::test]
    async fn count_threshold_triggers_flush() {
        let (store, _tp, writer) = writer_with(EventWriterConfig {
            max_buffer_size: 2,
            ..Default::default()
        });

        writer.append(event(1_000, "a")).await.unwrap();
        assert_eq!(writer.buffered(), 1);
        writer.append(event(2_000, "b")).await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let files = store
            .list_all(&Path::parse("events").unwrap())
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn byte_threshold_triggers_flush() {
        let (_store, _tp, writer) = writer_with(EventWriterConfig {
            max_buffer_bytes: 1,
            ..Default::default()
        });
        writer.append(event(1_000, "a")).await.unwrap();
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.stats().total_flushes, 1);
    }

    #[tokio::test]
    async fn observer_sees_batch_exactly_once() {
        let (_store, _tp, writer) = writer_with(EventWriterConfig::default());
        let observer = Arc::new(RecordingObserver::default());
        writer.on_flush(Arc::clone(&observer) as _);

        writer.append(event(2_000, "late")).await.unwrap();
        writer.append(event(1_000, "early")).await.unwrap();
        writer.flush().await.unwrap();

        let batches = observer.batches.lock();
        assert_eq!(batches.len(), 1);
        // batch arrives in (ts, id) order
        assert_eq!(batches[0][0].ts, 1_000);
        assert_eq!(batches[0][1].ts, 2_000);
    }

    #[tokio::test]
    async fn failing_observer_restores_buffer() {
        let (store, _tp, writer) = writer_with(EventWriterConfig::default());
        let observer = Arc::new(RecordingObserver::default());
        observer
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        writer.on_flush(Arc::clone(&observer) as _);

        writer.append(event(1_000, "a")).await.unwrap();
        writer.append(event(2_000, "b")).await.unwrap();
        let before = writer.buffered_events();

        writer.flush().await.unwrap_err();

        // buffer intact, nothing durable, stats untouched
        let after = writer.buffered_events();
        assert_eq!(
            before.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            after.iter().map(|e| e.id.clone()).collect::<Vec<_>>()
        );
        assert_eq!(writer.stats().total_flushes, 0);
        let files = store
            .list_all(&Path::parse("events").unwrap())
            .await
            .unwrap();
        assert!(files.is_empty());

        // recovery: observer healthy again, same events flush fine
        observer
            .fail
            .store(false, std::sync::atomic::Ordering::SeqCst);
        writer.flush().await.unwrap();
        assert_eq!(writer.stats().total_events_written, 2);
    }

    #[tokio::test]
    async fn concurrent_flush_no_ops_on_empty_buffer() {
        let (_store, _tp, writer) = writer_with(EventWriterConfig::default());
        let writer = Arc::new(writer);
        writer.append(event(1_000, "a")).await.unwrap();

        let w1 = Arc::clone(&writer);
        let w2 = Arc::clone(&writer);
        let (r1, r2) = tokio::join!(w1.flush(), w2.flush());
        r1.unwrap();
        r2.unwrap();

        // only one flush did work
        assert_eq!(writer.stats().total_flushes, 1);
        assert_eq!(writer.stats().total_events_written, 1);
    }

    #[tokio::test]
    async fn wal_recovery_repopulates_buffer() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let codec = Arc::new(ParquetCodec::new());
        let tp: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let wal_path = Path::parse("events/wal-0.journal").unwrap();

        let writer = EventWriter::with_wal(
            EventWriterConfig::default(),
            Arc::clone(&store),
            Arc::clone(&codec) as _,
            Arc::clone(&tp),
            Wal::new(Arc::clone(&store), wal_path.clone()),
        )
        .await
        .unwrap();
        writer.append(event(1_000, "a")).await.unwrap();
        drop(writer);

        // simulated crash: a new writer picks the event up from the journal
        let writer = EventWriter::with_wal(
            EventWriterConfig::default(),
            Arc::clone(&store),
            codec as _,
            tp,
            Wal::new(Arc::clone(&store), wal_path.clone()),
        )
        .await
        .unwrap();
        assert_eq!(writer.buffered(), 1);

        writer.flush().await.unwrap();
        // flushed and journal truncated
        assert_eq!(writer.buffered(), 0);
        assert!(!store.exists(&wal_path).await.unwrap());
    }

    #[tokio::test]
    async fn background_flusher_runs_and_stops() {
        let (_store, _tp, writer) = writer_with(EventWriterConfig {
            flush_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let writer = Arc::new(writer);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_flusher(Arc::clone(&writer), shutdown.clone()));

        writer.append(event(1_000, "a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer.buffered(), 0);

        // events appended after shutdown still flush once on the way out
        writer.append(event(2_000, "b")).await.unwrap();
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.stats().total_events_written, 2);
    }
}
