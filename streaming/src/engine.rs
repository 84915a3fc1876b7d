use crate::{
    CodecSnafu, DuplicateViewSnafu, Result, SinkMode, SinkSnafu, StoreSnafu, StreamingView,
    ViewDefinition,
};
use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use columnar::ColumnarCodec;
use data_types::{Document, EntityId, Event, NamespaceSchema, Value};
use db_time::TimeProvider;
use entity_store::{EntityBackend, UpdateDoc, UpdateOptions, WriteOptions};
use event_log::FlushObserver;
use object_store::{ObjectStore, Path};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Buffered writer persisting view outputs as a time-partitioned Parquet
/// dataset under `views/<view>/year=/month=/day=/hour=/part-<ts>.parquet`.
///
/// Flushes on the row threshold or on demand; a failed flush restores the
/// buffer so no output is lost; [`stop`](Self::stop) drains what remains.
#[derive(Debug)]
pub struct MvDatasetWriter {
    view_name: String,
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn ColumnarCodec>,
    time_provider: Arc<dyn TimeProvider>,
    max_buffer_rows: usize,
    buffer: Vec<Document>,
}

impl MvDatasetWriter {
    /// Create a writer for `view_name`.
    pub fn new(
        view_name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        codec: Arc<dyn ColumnarCodec>,
        time_provider: Arc<dyn TimeProvider>,
        max_buffer_rows: usize,
    ) -> Self {
        Self {
            view_name: view_name.into(),
            store,
            codec,
            time_provider,
            max_buffer_rows: max_buffer_rows.max(1),
            buffer: vec![],
        }
    }

    /// Rows waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Queue a row, flushing when the threshold is reached.
    pub async fn push(&mut self, row: Document) -> Result<()> {
        self.buffer.push(row);
        if self.buffer.len() >= self.max_buffer_rows {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write the buffer as one partitioned Parquet file.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        let result = self.write_rows(&rows).await;
        if let Err(e) = result {
            // restore so nothing is lost; newer rows queue behind
            let mut restored = rows;
            restored.extend(std::mem::take(&mut self.buffer));
            self.buffer = restored;
            return Err(e);
        }
        Ok(())
    }

    /// Flush whatever remains and drop the writer's claim on the dataset.
    pub async fn stop(&mut self) -> Result<()> {
        self.flush().await
    }

    async fn write_rows(&self, rows: &[Document]) -> Result<()> {
        let encoded = self
            .codec
            .encode_rows(&NamespaceSchema::default(), rows)
            .context(CodecSnafu)?;

        let ms = self.time_provider.now().timestamp_millis();
        let dt = Utc.timestamp_millis_opt(ms).single().expect("valid time");
        let path = Path::parse(format!(
            "views/{}/year={:04}/month={:02}/day={:02}/hour={:02}/part-{ms}.parquet",
            self.view_name,
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
        ))
        .expect("view names are validated");
        self.store
            .write_atomic(&path, encoded.bytes)
            .await
            .context(StoreSnafu)?;
        info!(view = self.view_name.as_str(), rows = rows.len(), path = %path, "view dataset flushed");
        Ok(())
    }
}

struct ViewRuntime {
    view: StreamingView,
    dataset: Option<MvDatasetWriter>,
}

impl std::fmt::Debug for ViewRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewRuntime")
            .field("view", &self.view.definition().name)
            .field("persists", &self.dataset.is_some())
            .finish()
    }
}

/// Runs registered views against flushed event batches and maintains
/// their outputs.
///
/// Registered as a flush observer on the event writer, the engine
/// receives each batch exactly once, already deduplicated and
/// time-ordered, refreshes every view's aggregate state, upserts the
/// results into the sink collections and optionally appends them to the
/// view's Parquet dataset.
#[derive(Debug)]
pub struct MaterializedViewEngine {
    sink_backend: Arc<dyn EntityBackend>,
    time_provider: Arc<dyn TimeProvider>,
    views: Mutex<BTreeMap<String, ViewRuntime>>,
}

impl MaterializedViewEngine {
    /// Create an engine writing sink records through `sink_backend`.
    pub fn new(
        sink_backend: Arc<dyn EntityBackend>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            sink_backend,
            time_provider,
            views: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a view; `dataset` adds Parquet persistence of its
    /// outputs.
    pub async fn register_view(
        &self,
        definition: ViewDefinition,
        dataset: Option<MvDatasetWriter>,
    ) -> Result<()> {
        let mut views = self.views.lock().await;
        ensure!(
            !views.contains_key(&definition.name),
            DuplicateViewSnafu {
                name: definition.name.clone(),
            }
        );
        let name = definition.name.clone();
        let registered_at = self.time_provider.now().timestamp_millis();
        views.insert(
            name.clone(),
            ViewRuntime {
                view: StreamingView::new(definition, registered_at),
                dataset,
            },
        );
        info!(view = name.as_str(), "view registered");
        Ok(())
    }

    /// Current outputs of one view.
    pub async fn results(&self, view_name: &str) -> Vec<crate::WindowOutput> {
        let views = self.views.lock().await;
        views
            .get(view_name)
            .map(|r| r.view.results())
            .unwrap_or_default()
    }

    /// Feed one batch through every registered view.
    pub async fn process_batch(&self, events: &[Event]) -> Result<()> {
        let mut views = self.views.lock().await;
        for runtime in views.values_mut() {
            let definition = runtime.view.definition().clone();
            let output = runtime.view.apply_batch(events);

            let sink = definition.sink();
            for update in &output.updates {
                let doc = update.to_document(&definition.name);
                match sink.mode {
                    SinkMode::Upsert => {
                        self.upsert(&sink.collection, &update.sink_id(), doc.clone())
                            .await?;
                    }
                    SinkMode::Append => {
                        self.sink_backend
                            .create(&sink.collection, None, doc.clone(), &WriteOptions::default())
                            .await
                            .context(SinkSnafu)?;
                    }
                }
                if let Some(dataset) = &mut runtime.dataset {
                    dataset.push(doc).await?;
                }
            }

            // late events with the side-output policy land in their own
            // collection
            if let Some(side_collection) = &definition.watermark.side_output_collection {
                for event in &output.side_output {
                    let mut doc = Document::new();
                    doc.insert("eventId".to_string(), Value::String(event.id.to_string()));
                    doc.insert("ts".to_string(), Value::Date(event.ts));
                    doc.insert("target".to_string(), Value::String(event.target.clone()));
                    self.sink_backend
                        .create(side_collection, None, doc, &WriteOptions::default())
                        .await
                        .context(SinkSnafu)?;
                }
            }
        }
        Ok(())
    }

    /// Flush all view datasets and stop accepting work.
    pub async fn stop(&self) -> Result<()> {
        let mut views = self.views.lock().await;
        for runtime in views.values_mut() {
            if let Some(dataset) = &mut runtime.dataset {
                dataset.stop().await?;
            }
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, local_id: &str, doc: Document) -> Result<()> {
        let id = match EntityId::new(collection, local_id) {
            Ok(id) => id,
            Err(e) => {
                return Err(crate::Error::Sink {
                    source: entity_store::Error::InvalidId { source: e },
                })
            }
        };
        let mut update = UpdateDoc::new();
        for (key, value) in &doc {
            update = update.set(key.clone(), value.clone());
        }
        match self
            .sink_backend
            .update(&id, &update, &UpdateOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(entity_store::Error::NotFound { .. }) => {
                self.sink_backend
                    .create(collection, Some(local_id.to_string()), doc, &WriteOptions::default())
                    .await
                    .context(SinkSnafu)?;
                Ok(())
            }
            Err(e) => Err(crate::Error::Sink { source: e }),
        }
    }
}

#[async_trait]
impl FlushObserver for MaterializedViewEngine {
    async fn on_flush(
        &self,
        events: &[Event],
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Err(e) = self.process_batch(events).await {
            error!(error = %e, "materialized view refresh failed");
            return Err(Box::new(e));
        }
        Ok(())
    }
}
