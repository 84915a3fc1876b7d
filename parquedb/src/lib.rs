//! ParqueDB: an embedded, event-sourced document database whose durable
//! state is Parquet files over a pluggable object store.
//!
//! [`Database`] is the composition root: it wires the object store, the
//! event log (WAL + buffered writer + batch scans), the entity backend,
//! snapshots, transactions, compaction, retention and streaming views
//! into one handle. There are no process-wide singletons: every
//! component receives its collaborators explicitly, and a second
//! `Database` over the same store is just another handle.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use bytes::Bytes;
use columnar::{ColumnarCodec, ParquetCodec};
use compactor::{CompactionScheduler, CompactorConfig};
use data_types::{Document, Entity, EntityId, NamespaceSchema};
use db_time::{SystemProvider, TimeProvider};
use entity_store::{
    DeleteOptions, EntityBackend, FindOptions, NativeBackend, NativeConfig, ReadOptions,
    UpdateDoc, UpdateOptions, WriteOptions,
};
use event_log::{
    replay::ReplayStats,
    snapshot::{SnapshotConfig, SnapshotStore},
    BatchEventSource, EventLog, EventWriter, EventWriterConfig, Wal,
};
use object_store::{ObjectStore, Path};
use predicate::Filter;
use retention::{RetentionConfig, RetentionManager};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};
use std::sync::Arc;
use streaming::MaterializedViewEngine;
use tracing::info;
use transaction::TransactionManager;

/// Database-level errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("database not initialized (missing parquedb.json)"))]
    NotInitialized,

    #[snafu(display("database already initialized"))]
    AlreadyInitialized,

    #[snafu(display("parquedb.json corrupt: {}", source))]
    ConfigCorrupt { source: serde_json::Error },

    #[snafu(display("object store failure: {}", source))]
    Store { source: object_store::Error },

    #[snafu(display("{}", source))]
    Backend { source: entity_store::Error },

    #[snafu(display("{}", source))]
    Events { source: event_log::Error },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

const CONFIG_FILE: &str = "parquedb.json";
const FORMAT_VERSION: u32 = 1;

/// The persisted `parquedb.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseManifest {
    /// On-disk format version.
    pub version: u32,
    /// Database name.
    pub name: String,
    /// Storage description.
    pub storage: StorageManifest,
    /// Creation time (ms since epoch).
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

/// The `storage` section of `parquedb.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageManifest {
    /// Backend type name (`memory` / `file` / `remote`).
    #[serde(rename = "type")]
    pub store_type: String,
    /// Directory for entity segments.
    #[serde(rename = "dataDir")]
    pub data_dir: String,
    /// Directory for event batches.
    #[serde(rename = "eventsDir")]
    pub events_dir: String,
}

/// Tunables applied at open time.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Fail every mutating entry point.
    pub read_only: bool,
    /// Event writer thresholds.
    pub writer: EventWriterConfig,
    /// Snapshot policy.
    pub snapshots: SnapshotConfig,
    /// Compaction policy.
    pub compaction: CompactorConfig,
    /// Journal un-flushed events to a WAL file.
    pub use_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            writer: EventWriterConfig::default(),
            snapshots: SnapshotConfig::default(),
            compaction: CompactorConfig::default(),
            use_wal: true,
        }
    }
}

/// The database handle.
#[derive(Debug)]
pub struct Database {
    manifest: DatabaseManifest,
    store: Arc<dyn ObjectStore>,
    time_provider: Arc<dyn TimeProvider>,
    events: Arc<EventLog>,
    snapshots: Arc<SnapshotStore>,
    backend: Arc<NativeBackend>,
    compaction: CompactionScheduler,
    views: MaterializedViewEngine,
    transactions: TransactionManager,
}

impl Database {
    fn config_path() -> Path {
        Path::parse(CONFIG_FILE).expect("static path")
    }

    /// Initialize a fresh database in `store`, then open it.
    pub async fn init(
        store: Arc<dyn ObjectStore>,
        name: impl Into<String>,
        time_provider: Arc<dyn TimeProvider>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let path = Self::config_path();
        ensure!(
            !store.exists(&path).await.context(StoreSnafu)?,
            AlreadyInitializedSnafu
        );

        let manifest = DatabaseManifest {
            version: FORMAT_VERSION,
            name: name.into(),
            storage: StorageManifest {
                store_type: store.type_name().to_string(),
                data_dir: "data".to_string(),
                events_dir: "events".to_string(),
            },
            created_at: time_provider.now().timestamp_millis(),
        };
        let json = serde_json::to_vec_pretty(&manifest).expect("manifest serializes");
        store
            .write_atomic(&path, Bytes::from(json))
            .await
            .context(StoreSnafu)?;
        info!(name = manifest.name.as_str(), "database initialized");

        Self::open(store, time_provider, config).await
    }

    /// Open an existing database.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        time_provider: Arc<dyn TimeProvider>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let raw = match store.read(&Self::config_path()).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Err(Error::NotInitialized),
            Err(e) => return Err(Error::Store { source: e }),
        };
        let manifest: DatabaseManifest =
            serde_json::from_slice(&raw).context(ConfigCorruptSnafu)?;

        let codec: Arc<dyn ColumnarCodec> = Arc::new(ParquetCodec::new());

        let writer = if config.use_wal {
            let wal = Wal::new(
                Arc::clone(&store),
                Path::parse("events/wal-0.journal").expect("static path"),
            );
            Arc::new(
                EventWriter::with_wal(
                    config.writer,
                    Arc::clone(&store),
                    Arc::clone(&codec),
                    Arc::clone(&time_provider),
                    wal,
                )
                .await
                .context(EventsSnafu)?,
            )
        } else {
            Arc::new(EventWriter::new(
                config.writer,
                Arc::clone(&store),
                Arc::clone(&codec),
                Arc::clone(&time_provider),
            ))
        };
        let events = Arc::new(EventLog::new(
            Arc::clone(&writer),
            BatchEventSource::new(Arc::clone(&store), Arc::clone(&codec)),
        ));
        let snapshots = Arc::new(SnapshotStore::new(
            Arc::clone(&store),
            config.snapshots,
        ));

        let backend = Arc::new(
            NativeBackend::open(
                Arc::clone(&store),
                Arc::clone(&codec),
                Arc::clone(&time_provider),
                Arc::clone(&events),
                Arc::clone(&snapshots),
                NativeConfig {
                    read_only: config.read_only,
                    auto_snapshot_threshold: config.snapshots.auto_snapshot_threshold as u64,
                },
            )
            .await
            .context(BackendSnafu)?,
        );

        let compaction = CompactionScheduler::new(
            Arc::clone(&store),
            Arc::clone(&codec),
            Arc::clone(&time_provider),
            config.compaction,
        );
        let views = MaterializedViewEngine::new(
            Arc::clone(&backend) as Arc<dyn EntityBackend>,
            Arc::clone(&time_provider),
        );
        let transactions = TransactionManager::new(Arc::clone(&backend) as _);

        Ok(Self {
            manifest,
            store,
            time_provider,
            events,
            snapshots,
            backend,
            compaction,
            views,
            transactions,
        })
    }

    /// Open over an in-memory store on the system clock, initializing on
    /// first use. Mostly a testing convenience.
    pub async fn open_in_memory(name: impl Into<String>) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::InMemory::new());
        Self::init(
            store,
            name,
            Arc::new(SystemProvider::new()),
            DatabaseConfig::default(),
        )
        .await
    }

    /// The persisted database manifest.
    pub fn manifest(&self) -> &DatabaseManifest {
        &self.manifest
    }

    /// The underlying object store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The event log.
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// The snapshot store.
    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// The entity backend.
    pub fn backend(&self) -> &Arc<NativeBackend> {
        &self.backend
    }

    /// The compaction scheduler.
    pub fn compaction(&self) -> &CompactionScheduler {
        &self.compaction
    }

    /// The streaming-view engine.
    pub fn views(&self) -> &MaterializedViewEngine {
        &self.views
    }

    /// A CRUD handle over one namespace.
    pub fn collection(&self, ns: impl Into<String>) -> Collection<'_> {
        Collection {
            db: self,
            ns: ns.into(),
        }
    }

    /// Begin a multi-entity transaction.
    pub fn transaction(&self) -> transaction::Transaction {
        self.transactions.begin()
    }

    /// A retention manager over one collection.
    pub fn retention(&self, config: RetentionConfig) -> RetentionManager {
        RetentionManager::new(
            Arc::clone(&self.backend) as _,
            Arc::clone(&self.time_provider),
            config,
        )
    }

    /// Entity state at `ts`, replayed from the event log (snapshot
    /// accelerated), together with the replay bookkeeping.
    pub async fn get_at_with_stats(
        &self,
        id: &EntityId,
        ts: i64,
    ) -> Result<(Option<Entity>, ReplayStats)> {
        let history = self.events.get_history(id).await.context(EventsSnafu)?;
        let (result, stats) = self
            .snapshots
            .replay_at(id.namespace(), id.local_id(), &history, ts)
            .await
            .context(EventsSnafu)?;
        Ok((result.state.and_then(Entity::from_full_document), stats))
    }

    /// Entities holding a forward link `relation` to `target`.
    pub async fn get_related(&self, target: &EntityId, relation: &str) -> Result<Vec<Entity>> {
        self.backend
            .get_related(target, relation)
            .await
            .context(BackendSnafu)
    }

    /// Persist working sets and flush the event buffer.
    pub async fn flush(&self) -> Result<()> {
        self.backend.flush().await.context(BackendSnafu)
    }

    /// Flush everything and stop background machinery.
    pub async fn close(&self) -> Result<()> {
        self.flush().await?;
        self.views.stop().await.map_err(|e| Error::Backend {
            source: entity_store::Error::Validation {
                reason: e.to_string(),
            },
        })
    }
}

/// Outcome of a validated batch ingestion.
#[derive(Debug)]
pub struct IngestReport {
    /// Entities created from the valid documents.
    pub created: Vec<Entity>,
    /// Documents rejected by validation, with positions and reasons.
    pub invalid: Vec<entity_store::InvalidDocument>,
}

/// CRUD over one namespace, delegating to the backend.
#[derive(Debug)]
pub struct Collection<'db> {
    db: &'db Database,
    ns: String,
}

impl Collection<'_> {
    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.ns
    }

    /// Create one entity; a supplied `id` makes this create-at-id.
    pub async fn create(&self, id: Option<String>, body: Document) -> Result<Entity> {
        self.db
            .backend
            .create(&self.ns, id, body, &WriteOptions::default())
            .await
            .context(BackendSnafu)
    }

    /// Create many entities.
    pub async fn bulk_create(&self, bodies: Vec<Document>) -> Result<Vec<Entity>> {
        self.db
            .backend
            .bulk_create(&self.ns, bodies, &WriteOptions::default())
            .await
            .context(BackendSnafu)
    }

    /// Validated batch ingestion.
    ///
    /// Invalid documents are counted and skipped rather than aborting the
    /// batch; with `throw_on_error` the first invalid document fails the
    /// whole call before anything is written.
    pub async fn ingest(
        &self,
        bodies: Vec<Document>,
        throw_on_error: bool,
    ) -> Result<IngestReport> {
        let (valid, invalid) = if throw_on_error {
            let valid = entity_store::validate_batch_strict(&bodies).context(BackendSnafu)?;
            (valid, vec![])
        } else {
            let split = entity_store::validate_batch(&bodies);
            (split.valid, split.invalid)
        };

        let created = self
            .db
            .backend
            .bulk_create(&self.ns, valid, &WriteOptions::default())
            .await
            .context(BackendSnafu)?;
        Ok(IngestReport { created, invalid })
    }

    /// Fetch by local id.
    pub async fn get(&self, local_id: &str) -> Result<Option<Entity>> {
        let id = EntityId::new(&self.ns, local_id)
            .map_err(|source| Error::Backend {
                source: entity_store::Error::InvalidId { source },
            })?;
        self.db
            .backend
            .get(&id, &ReadOptions::default())
            .await
            .context(BackendSnafu)
    }

    /// Fetch the state as of `ts` (event replay).
    pub async fn get_at(&self, local_id: &str, ts: i64) -> Result<Option<Entity>> {
        let id = EntityId::new(&self.ns, local_id)
            .map_err(|source| Error::Backend {
                source: entity_store::Error::InvalidId { source },
            })?;
        self.db
            .backend
            .get(
                &id,
                &ReadOptions {
                    at: Some(ts),
                    ..Default::default()
                },
            )
            .await
            .context(BackendSnafu)
    }

    /// Filtered scan.
    pub async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Entity>> {
        self.db
            .backend
            .find(&self.ns, filter, options)
            .await
            .context(BackendSnafu)
    }

    /// Apply update operators.
    pub async fn update(
        &self,
        local_id: &str,
        update: &UpdateDoc,
        options: &UpdateOptions,
    ) -> Result<Entity> {
        let id = EntityId::new(&self.ns, local_id)
            .map_err(|source| Error::Backend {
                source: entity_store::Error::InvalidId { source },
            })?;
        self.db
            .backend
            .update(&id, update, options)
            .await
            .context(BackendSnafu)
    }

    /// Soft- or hard-delete.
    pub async fn delete(&self, local_id: &str, options: &DeleteOptions) -> Result<bool> {
        let id = EntityId::new(&self.ns, local_id)
            .map_err(|source| Error::Backend {
                source: entity_store::Error::InvalidId { source },
            })?;
        self.db
            .backend
            .delete(&id, options)
            .await
            .context(BackendSnafu)
    }

    /// Undo a soft delete.
    pub async fn restore(&self, local_id: &str) -> Result<Entity> {
        let id = EntityId::new(&self.ns, local_id)
            .map_err(|source| Error::Backend {
                source: entity_store::Error::InvalidId { source },
            })?;
        self.db.backend.restore(&id).await.context(BackendSnafu)
    }

    /// Declare the namespace schema.
    pub async fn set_schema(&self, schema: NamespaceSchema) -> Result<()> {
        self.db
            .backend
            .set_schema(&self.ns, schema)
            .await
            .context(BackendSnafu)
    }

    /// Declare a unique index over a flat field.
    pub async fn create_unique_index(&self, name: &str, field: &str, sparse: bool) -> Result<()> {
        self.db
            .backend
            .create_unique_index(&self.ns, name, field, sparse)
            .await
            .context(BackendSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::doc;
    use db_time::{MockProvider, Time};
    use object_store::InMemory;

    #[tokio::test]
    async fn init_writes_manifest_and_open_validates() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(42)));

        // open before init fails
        let err = Database::open(
            Arc::clone(&store),
            Arc::clone(&time_provider) as _,
            DatabaseConfig::default(),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::NotInitialized);

        let db = Database::init(
            Arc::clone(&store),
            "blog",
            Arc::clone(&time_provider) as _,
            DatabaseConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(db.manifest().name, "blog");
        assert_eq!(db.manifest().version, 1);
        assert_eq!(db.manifest().storage.store_type, "memory");
        assert_eq!(db.manifest().created_at, 42);

        // double init fails
        let err = Database::init(
            Arc::clone(&store),
            "blog",
            time_provider as _,
            DatabaseConfig::default(),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::AlreadyInitialized);
    }

    #[tokio::test]
    async fn collection_crud_surface() {
        let db = Database::open_in_memory("t").await.unwrap();
        let posts = db.collection("posts");

        let created = posts
            .create(Some("p1".into()), doc! {"title" => "V1"})
            .await
            .unwrap();
        assert_eq!(created.id.canonical(), "posts/p1");

        let fetched = posts.get("p1").await.unwrap().unwrap();
        assert_eq!(fetched, created);

        posts
            .update("p1", &UpdateDoc::new().set("title", "V2"), &UpdateOptions::default())
            .await
            .unwrap();
        assert!(posts.delete("p1", &DeleteOptions::default()).await.unwrap());
        assert!(posts.get("p1").await.unwrap().is_none());
        let restored = posts.restore("p1").await.unwrap();
        assert_eq!(restored.meta.version, 4);
    }

    #[tokio::test]
    async fn ingest_reports_invalid_documents() {
        let db = Database::open_in_memory("t").await.unwrap();
        let posts = db.collection("posts");

        let bodies = vec![
            doc! {"title" => "ok"},
            doc! {"$id" => "posts/forged"},
            doc! {"title" => "also ok"},
        ];

        // lenient: invalid entries are skipped and reported
        let report = posts.ingest(bodies.clone(), false).await.unwrap();
        assert_eq!(report.created.len(), 2);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(report.invalid[0].index, 1);

        // strict: the first invalid document fails the batch up front
        let err = posts.ingest(bodies, true).await.unwrap_err();
        assert!(err.to_string().contains("invalid"));
        let all = posts
            .find(&Filter::new(), &entity_store::FindOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
