use crate::{
    AlreadyExistsSnafu, BackendStats, CodecSnafu, DeleteOptions, EntityBackend, Error,
    EventsSnafu, FindOptions, InvalidIdSnafu, NamespaceStats, NotDeletedSnafu, NotFoundSnafu,
    ReadOptions, Result, StoreSnafu, UpdateDoc, UpdateOptions, VersionMismatchSnafu,
    WriteOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use columnar::ColumnarCodec;
use data_types::{
    Document, Entity, EntityId, Event, EventOp, ManifestFile, NamespaceSchema,
    RelationshipDef, SnapshotOperation, TableSnapshot, Value,
};
use db_time::TimeProvider;
use event_log::EventLog;
use object_store::{ObjectStore, Path};
use predicate::{analyze_filter_for_pushdown, matches_filter, may_match, Filter};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// One numbered `<n>.metadata.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TableMetadata {
    table: String,
    #[serde(default)]
    schema: NamespaceSchema,
    #[serde(default)]
    snapshots: Vec<TableSnapshot>,
    #[serde(rename = "currentSnapshotId", default)]
    current_snapshot_id: Option<u64>,
}

impl TableMetadata {
    fn current_files(&self) -> &[ManifestFile] {
        self.snapshots
            .iter()
            .rev()
            .find(|s| Some(s.snapshot_id) == self.current_snapshot_id)
            .map(|s| s.files.as_slice())
            .unwrap_or(&[])
    }
}

/// Iceberg-style layout: `warehouse/<db>/<ns>/data/*.parquet` plus
/// numbered metadata documents and a `version-hint.txt` pointer updated
/// by ETag CAS.
///
/// Every commit is a new table snapshot (`append` for creates,
/// `overwrite` for updates and soft deletes, `delete` when rows go away)
/// carrying the live file list and record count. The hint file is the
/// only mutable object; everything else is immutable once written.
#[derive(Debug)]
pub struct IcebergBackend {
    db: String,
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn ColumnarCodec>,
    time_provider: Arc<dyn TimeProvider>,
    events: Arc<EventLog>,
    read_only: bool,
    // single-writer commit section
    commit_lock: tokio::sync::Mutex<()>,
}

impl IcebergBackend {
    /// Create a backend for warehouse database `db`.
    pub fn new(
        db: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        codec: Arc<dyn ColumnarCodec>,
        time_provider: Arc<dyn TimeProvider>,
        events: Arc<EventLog>,
        read_only: bool,
    ) -> Self {
        Self {
            db: db.into(),
            store,
            codec,
            time_provider,
            events,
            read_only,
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn now_ms(&self) -> i64 {
        self.time_provider.now().timestamp_millis()
    }

    fn check_writable(&self) -> Result<()> {
        ensure!(!self.read_only, crate::ReadOnlySnafu);
        Ok(())
    }

    fn table_prefix(&self, ns: &str) -> Path {
        Path::parse(format!("warehouse/{}/{ns}", self.db)).expect("validated names")
    }

    fn hint_path(&self, ns: &str) -> Path {
        self.table_prefix(ns)
            .join("version-hint.txt")
            .expect("static name")
    }

    fn metadata_path(&self, ns: &str, version: u64) -> Path {
        self.table_prefix(ns)
            .join(&format!("metadata/{version}.metadata.json"))
            .expect("static name")
    }

    async fn current_version(&self, ns: &str) -> Result<Option<(u64, Option<String>)>> {
        match self.store.read(&self.hint_path(ns)).await {
            Ok(raw) => {
                let text = String::from_utf8_lossy(&raw);
                let version = text.trim().parse::<u64>().map_err(|_| Error::Validation {
                    reason: format!("corrupt version hint for {ns:?}: {text:?}"),
                })?;
                let etag = self
                    .store
                    .stat(&self.hint_path(ns))
                    .await
                    .context(StoreSnafu)?
                    .etag;
                Ok(Some((version, etag)))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).context(StoreSnafu),
        }
    }

    async fn load_metadata(&self, ns: &str) -> Result<(TableMetadata, u64, Option<String>)> {
        match self.current_version(ns).await? {
            None => Ok((
                TableMetadata {
                    table: ns.to_string(),
                    ..Default::default()
                },
                0,
                None,
            )),
            Some((version, etag)) => {
                let raw = self
                    .store
                    .read(&self.metadata_path(ns, version))
                    .await
                    .context(StoreSnafu)?;
                let metadata =
                    serde_json::from_slice(&raw).map_err(|e| Error::Validation {
                        reason: format!("corrupt metadata {version} for {ns:?}: {e}"),
                    })?;
                Ok((metadata, version, etag))
            }
        }
    }

    /// Decode the live rows of a table, newest version per id, optionally
    /// pruning files by pushdown predicates.
    async fn load_rows(
        &self,
        metadata: &TableMetadata,
        predicates: &[predicate::ColumnPredicate],
    ) -> Result<BTreeMap<String, Entity>> {
        let mut out: BTreeMap<String, Entity> = BTreeMap::new();
        let mut pruned = 0usize;
        for file in metadata.current_files() {
            let path = Path::parse(&file.path).map_err(|e| Error::Validation {
                reason: format!("bad file path in metadata: {e}"),
            })?;
            let bytes = self.store.read(&path).await.context(StoreSnafu)?;
            if !predicates.is_empty() {
                let stats = self.codec.read_stats(&bytes).context(CodecSnafu)?;
                if !may_match(&stats, predicates) {
                    pruned += 1;
                    continue;
                }
            }
            for row in self.codec.decode_rows(&bytes).context(CodecSnafu)? {
                if let Some(entity) = Entity::from_full_document(row) {
                    let local = entity.id.local_id().to_string();
                    match out.get(&local) {
                        Some(existing) if existing.meta.version >= entity.meta.version => {}
                        _ => {
                            out.insert(local, entity);
                        }
                    }
                }
            }
        }
        if pruned > 0 {
            debug!(table = metadata.table.as_str(), pruned, "files pruned by statistics");
        }
        Ok(out)
    }

    /// Write `rows` as a new data file and commit a new snapshot +
    /// metadata version, CAS-ing the version hint.
    async fn commit(
        &self,
        ns: &str,
        mut metadata: TableMetadata,
        version: u64,
        hint_etag: Option<String>,
        rows: &BTreeMap<String, Entity>,
        operation: SnapshotOperation,
    ) -> Result<()> {
        let snapshot_id = metadata
            .snapshots
            .last()
            .map(|s| s.snapshot_id + 1)
            .unwrap_or(1);

        let files = if rows.is_empty() {
            vec![]
        } else {
            let docs: Vec<Document> = rows.values().map(Entity::to_full_document).collect();
            let encoded = self
                .codec
                .encode_rows(&metadata.schema, &docs)
                .context(CodecSnafu)?;
            let path = self
                .table_prefix(ns)
                .join(&format!(
                    "data/part-{snapshot_id:05}-{}.parquet",
                    Uuid::new_v4().simple()
                ))
                .expect("valid file name");
            self.store
                .write_atomic(&path, encoded.bytes.clone())
                .await
                .context(StoreSnafu)?;
            vec![ManifestFile {
                path: path.as_str().to_string(),
                size_bytes: encoded.bytes.len() as u64,
                content_hash: crate::ManifestStore::content_hash(&encoded.bytes),
            }]
        };

        metadata.snapshots.push(TableSnapshot {
            snapshot_id,
            timestamp_ms: self.now_ms(),
            operation,
            files,
            record_count: rows.len() as u64,
        });
        metadata.current_snapshot_id = Some(snapshot_id);

        let next_version = version + 1;
        let json = serde_json::to_vec(&metadata).expect("metadata serializes");
        self.store
            .write_atomic(&self.metadata_path(ns, next_version), Bytes::from(json))
            .await
            .context(StoreSnafu)?;

        self.store
            .write_conditional(
                &self.hint_path(ns),
                Bytes::from(next_version.to_string()),
                hint_etag.as_deref(),
            )
            .await
            .map_err(|e| Error::ManifestConflict { source: e })?;

        info!(
            table = ns,
            snapshot = snapshot_id,
            version = next_version,
            ?operation,
            "committed table snapshot"
        );
        Ok(())
    }

    async fn record_event(
        &self,
        op: EventOp,
        id: &EntityId,
        ts: i64,
        actor: Option<String>,
        before: Option<Document>,
        after: Option<Document>,
    ) -> Result<()> {
        let mut event = Event::new(op, id, ts);
        event.actor = actor;
        event.before = before;
        event.after = after;
        self.events.append(event).await.context(EventsSnafu)
    }

    fn event_ts(&self, previous: Option<&Entity>) -> i64 {
        let now = self.now_ms();
        match previous {
            Some(entity) => now.max(entity.meta.updated_at + 1),
            None => now,
        }
    }
}

#[async_trait]
impl EntityBackend for IcebergBackend {
    fn type_name(&self) -> &'static str {
        "iceberg"
    }

    fn supports_time_travel(&self) -> bool {
        false
    }

    fn supports_schema_evolution(&self) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    async fn create(
        &self,
        ns: &str,
        id: Option<String>,
        body: Document,
        options: &WriteOptions,
    ) -> Result<Entity> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock().await;

        let entity_id = match id {
            Some(local) => EntityId::new(ns, local).context(InvalidIdSnafu)?,
            None => EntityId::generate(ns).context(InvalidIdSnafu)?,
        };

        let (metadata, version, etag) = self.load_metadata(ns).await?;
        let mut rows = self.load_rows(&metadata, &[]).await?;
        ensure!(
            !rows.contains_key(entity_id.local_id()),
            AlreadyExistsSnafu {
                id: entity_id.canonical(),
            }
        );

        let ts = self.event_ts(None);
        let mut entity = Entity::new(entity_id.clone(), body, ts, options.actor.clone());
        entity.meta.entity_type = metadata.schema.entity_type.clone();
        rows.insert(entity_id.local_id().to_string(), entity.clone());

        self.commit(ns, metadata, version, etag, &rows, SnapshotOperation::Append)
            .await?;
        self.record_event(
            EventOp::Create,
            &entity_id,
            ts,
            options.actor.clone(),
            None,
            Some(entity.to_full_document()),
        )
        .await?;
        Ok(entity)
    }

    async fn bulk_create(
        &self,
        ns: &str,
        bodies: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<Vec<Entity>> {
        let mut created = Vec::with_capacity(bodies.len());
        for body in bodies {
            created.push(self.create(ns, None, body, options).await?);
        }
        Ok(created)
    }

    async fn get(&self, id: &EntityId, options: &ReadOptions) -> Result<Option<Entity>> {
        ensure!(
            options.at.is_none(),
            crate::ValidationSnafu {
                reason: "iceberg backend does not support time travel".to_string(),
            }
        );
        let (metadata, _, _) = self.load_metadata(id.namespace()).await?;
        let rows = self.load_rows(&metadata, &[]).await?;
        Ok(rows
            .get(id.local_id())
            .cloned()
            .filter(|e| options.include_deleted || !e.meta.is_deleted()))
    }

    async fn find(&self, ns: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Entity>> {
        let (metadata, _, _) = self.load_metadata(ns).await?;
        let analysis = analyze_filter_for_pushdown(filter, &metadata.schema.typed_columns);
        let rows = self
            .load_rows(&metadata, &analysis.pushdown_predicates)
            .await?;

        let mut results: Vec<Entity> = rows
            .into_values()
            .filter(|e| options.include_deleted || !e.meta.is_deleted())
            .filter(|e| matches_filter(&e.to_full_document(), filter))
            .collect();
        results.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn update(
        &self,
        id: &EntityId,
        update: &UpdateDoc,
        options: &UpdateOptions,
    ) -> Result<Entity> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock().await;

        let (metadata, version, etag) = self.load_metadata(id.namespace()).await?;
        let mut rows = self.load_rows(&metadata, &[]).await?;
        let before = rows
            .get(id.local_id())
            .filter(|e| !e.meta.is_deleted())
            .cloned()
            .context(NotFoundSnafu { id: id.canonical() })?;

        if let Some(expected) = options.expected_version {
            ensure!(
                before.meta.version == expected,
                VersionMismatchSnafu {
                    id: id.canonical(),
                    expected,
                    actual: before.meta.version,
                }
            );
        }

        let ts = self.event_ts(Some(&before));
        let mut after = before.clone();
        after.body = update.apply(&before.body)?;
        after.meta.version += 1;
        after.meta.updated_at = ts;
        after.meta.updated_by = options.actor.clone();
        rows.insert(id.local_id().to_string(), after.clone());

        self.commit(
            id.namespace(),
            metadata,
            version,
            etag,
            &rows,
            SnapshotOperation::Overwrite,
        )
        .await?;
        self.record_event(
            EventOp::Update,
            id,
            ts,
            options.actor.clone(),
            Some(before.to_full_document()),
            Some(after.to_full_document()),
        )
        .await?;
        Ok(after)
    }

    async fn bulk_update(
        &self,
        ns: &str,
        filter: &Filter,
        update: &UpdateDoc,
        options: &UpdateOptions,
    ) -> Result<u64> {
        let matches = self.find(ns, filter, &FindOptions::default()).await?;
        let mut changed = 0;
        for entity in matches {
            self.update(&entity.id, update, options).await?;
            changed += 1;
        }
        Ok(changed)
    }

    async fn delete(&self, id: &EntityId, options: &DeleteOptions) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock().await;

        let (metadata, version, etag) = self.load_metadata(id.namespace()).await?;
        let mut rows = self.load_rows(&metadata, &[]).await?;
        let Some(before) = rows.get(id.local_id()).cloned() else {
            return Ok(false);
        };
        if !options.hard && before.meta.is_deleted() {
            return Ok(false);
        }
        if let Some(expected) = options.expected_version {
            ensure!(
                before.meta.version == expected,
                VersionMismatchSnafu {
                    id: id.canonical(),
                    expected,
                    actual: before.meta.version,
                }
            );
        }
        let ts = self.event_ts(Some(&before));

        if options.hard {
            rows.remove(id.local_id());
            let operation = if rows.is_empty() {
                SnapshotOperation::Delete
            } else {
                SnapshotOperation::Overwrite
            };
            self.commit(id.namespace(), metadata, version, etag, &rows, operation)
                .await?;
            self.record_event(
                EventOp::Delete,
                id,
                ts,
                options.actor.clone(),
                Some(before.to_full_document()),
                None,
            )
            .await?;
        } else {
            let mut after = before.clone();
            after.meta.version += 1;
            after.meta.updated_at = ts;
            after.meta.deleted_at = Some(ts);
            after.meta.deleted_by = options.actor.clone();
            rows.insert(id.local_id().to_string(), after.clone());

            self.commit(
                id.namespace(),
                metadata,
                version,
                etag,
                &rows,
                SnapshotOperation::Overwrite,
            )
            .await?;
            self.record_event(
                EventOp::Update,
                id,
                ts,
                options.actor.clone(),
                Some(before.to_full_document()),
                Some(after.to_full_document()),
            )
            .await?;
        }
        Ok(true)
    }

    async fn bulk_delete(
        &self,
        ns: &str,
        filter: &Filter,
        options: &DeleteOptions,
    ) -> Result<u64> {
        let matches = self.find(ns, filter, &FindOptions::default()).await?;
        let mut deleted = 0;
        for entity in matches {
            if self.delete(&entity.id, options).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn restore(&self, id: &EntityId) -> Result<Entity> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock().await;

        let (metadata, version, etag) = self.load_metadata(id.namespace()).await?;
        let mut rows = self.load_rows(&metadata, &[]).await?;
        let before = rows
            .get(id.local_id())
            .cloned()
            .context(NotFoundSnafu { id: id.canonical() })?;
        ensure!(
            before.meta.is_deleted(),
            NotDeletedSnafu { id: id.canonical() }
        );

        let ts = self.event_ts(Some(&before));
        let mut after = before.clone();
        after.meta.version += 1;
        after.meta.updated_at = ts;
        after.meta.deleted_at = None;
        after.meta.deleted_by = None;
        rows.insert(id.local_id().to_string(), after.clone());

        self.commit(
            id.namespace(),
            metadata,
            version,
            etag,
            &rows,
            SnapshotOperation::Overwrite,
        )
        .await?;
        self.record_event(
            EventOp::Update,
            id,
            ts,
            None,
            Some(before.to_full_document()),
            Some(after.to_full_document()),
        )
        .await?;
        Ok(after)
    }

    async fn get_schema(&self, ns: &str) -> Result<Option<NamespaceSchema>> {
        let (metadata, _, _) = self.load_metadata(ns).await?;
        Ok(Some(metadata.schema))
    }

    async fn set_schema(&self, ns: &str, schema: NamespaceSchema) -> Result<()> {
        self.check_writable()?;
        let _guard = self.commit_lock.lock().await;

        let (mut metadata, version, etag) = self.load_metadata(ns).await?;
        metadata.schema = schema;
        let rows = self.load_rows(&metadata, &[]).await?;
        self.commit(ns, metadata, version, etag, &rows, SnapshotOperation::Overwrite)
            .await
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let prefix = Path::parse(format!("warehouse/{}", self.db)).expect("validated names");
        let entries = self.store.list_all(&prefix).await.context(StoreSnafu)?;
        let mut namespaces = std::collections::BTreeSet::new();
        let strip = format!("warehouse/{}/", self.db);
        for entry in entries {
            if let Some(rest) = entry.path.as_str().strip_prefix(&strip) {
                if let Some((ns, _)) = rest.split_once('/') {
                    namespaces.insert(ns.to_string());
                }
            }
        }
        Ok(namespaces.into_iter().collect())
    }

    async fn stats(&self) -> Result<BackendStats> {
        let mut stats = BackendStats::default();
        for ns in self.list_namespaces().await? {
            let (metadata, _, _) = self.load_metadata(&ns).await?;
            let rows = self.load_rows(&metadata, &[]).await?;
            let deleted = rows.values().filter(|e| e.meta.is_deleted()).count() as u64;
            let files = metadata.current_files();
            stats.namespaces.insert(
                ns,
                NamespaceStats {
                    entities: rows.len() as u64 - deleted,
                    deleted,
                    files: files.len() as u64,
                    bytes: files.iter().map(|f| f.size_bytes).sum(),
                },
            );
        }
        Ok(stats)
    }

    async fn get_related(&self, target: &EntityId, relation: &str) -> Result<Vec<Entity>> {
        // the reverse declaration on the target namespace names the source
        // side; the lookup is a filtered scan over the source table
        let (metadata, _, _) = self.load_metadata(target.namespace()).await?;
        let Some(RelationshipDef::Reverse { source_ns, forward }) =
            metadata.schema.relationships.get(relation).cloned()
        else {
            return Ok(vec![]);
        };

        let canonical = target.canonical();
        let (source_metadata, _, _) = self.load_metadata(&source_ns).await?;
        let rows = self.load_rows(&source_metadata, &[]).await?;
        Ok(rows
            .into_values()
            .filter(|e| !e.meta.is_deleted())
            .filter(|e| match e.body.get(&forward) {
                Some(Value::String(s)) => *s == canonical,
                Some(Value::Array(items)) => {
                    items.iter().any(|v| v.as_str() == Some(&canonical))
                }
                _ => false,
            })
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        // every commit is already durable; only the event buffer remains
        self.events.flush().await.context(EventsSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use columnar::ParquetCodec;
    use data_types::doc;
    use db_time::{MockProvider, Time};
    use event_log::{BatchEventSource, EventWriter, EventWriterConfig};
    use object_store::InMemory;

    async fn backend() -> (Arc<dyn ObjectStore>, IcebergBackend) {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let codec: Arc<dyn ColumnarCodec> = Arc::new(ParquetCodec::new());
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000)));
        let writer = Arc::new(EventWriter::new(
            EventWriterConfig::default(),
            Arc::clone(&store),
            Arc::clone(&codec),
            Arc::clone(&time_provider) as _,
        ));
        let events = Arc::new(EventLog::new(
            writer,
            BatchEventSource::new(Arc::clone(&store), Arc::clone(&codec)),
        ));
        let backend = IcebergBackend::new(
            "main",
            Arc::clone(&store),
            codec,
            time_provider as _,
            events,
            false,
        );
        (store, backend)
    }

    #[tokio::test]
    async fn create_commits_numbered_metadata_and_hint() {
        let (store, backend) = backend().await;
        backend
            .create("posts", Some("p1".into()), doc! {"title" => "V1"}, &WriteOptions::default())
            .await
            .unwrap();

        let hint = store
            .read(&Path::parse("warehouse/main/posts/version-hint.txt").unwrap())
            .await
            .unwrap();
        assert_eq!(&hint[..], b"1");
        assert!(store
            .exists(&Path::parse("warehouse/main/posts/metadata/1.metadata.json").unwrap())
            .await
            .unwrap());

        backend
            .create("posts", Some("p2".into()), doc! {"title" => "V2"}, &WriteOptions::default())
            .await
            .unwrap();
        let hint = store
            .read(&Path::parse("warehouse/main/posts/version-hint.txt").unwrap())
            .await
            .unwrap();
        assert_eq!(&hint[..], b"2");
    }

    #[tokio::test]
    async fn snapshots_record_operations_and_counts() {
        let (_store, backend) = backend().await;
        backend
            .create("posts", Some("p1".into()), doc! {"k" => 1i64}, &WriteOptions::default())
            .await
            .unwrap();
        let id = EntityId::new("posts", "p1").unwrap();
        backend
            .update(&id, &UpdateDoc::new().set("k", 2i64), &UpdateOptions::default())
            .await
            .unwrap();
        backend
            .delete(
                &id,
                &DeleteOptions {
                    hard: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (metadata, version, _) = backend.load_metadata("posts").await.unwrap();
        assert_eq!(version, 3);
        let ops: Vec<SnapshotOperation> =
            metadata.snapshots.iter().map(|s| s.operation).collect();
        assert_eq!(
            ops,
            [
                SnapshotOperation::Append,
                SnapshotOperation::Overwrite,
                SnapshotOperation::Delete,
            ]
        );
        assert_eq!(metadata.snapshots.last().unwrap().record_count, 0);
    }

    #[tokio::test]
    async fn crud_round_trip() {
        let (_store, backend) = backend().await;
        let id = EntityId::new("posts", "p1").unwrap();
        backend
            .create("posts", Some("p1".into()), doc! {"title" => "V1"}, &WriteOptions::default())
            .await
            .unwrap();

        let entity = backend.get(&id, &ReadOptions::default()).await.unwrap().unwrap();
        assert_eq!(entity.meta.version, 1);

        let updated = backend
            .update(&id, &UpdateDoc::new().set("title", "V2"), &UpdateOptions::default())
            .await
            .unwrap();
        assert_eq!(updated.meta.version, 2);

        // optimistic concurrency
        let err = backend
            .update(
                &id,
                &UpdateDoc::new().set("title", "V3"),
                &UpdateOptions {
                    expected_version: Some(1),
                    actor: None,
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::VersionMismatch { .. });

        // soft delete hides; restore revives
        backend.delete(&id, &DeleteOptions::default()).await.unwrap();
        assert!(backend.get(&id, &ReadOptions::default()).await.unwrap().is_none());
        let restored = backend.restore(&id).await.unwrap();
        assert_eq!(restored.meta.version, 4);
    }

    #[tokio::test]
    async fn reverse_relation_scan() {
        let (_store, backend) = backend().await;

        let mut users_schema = NamespaceSchema::default();
        users_schema.relationships.insert(
            "posts".to_string(),
            RelationshipDef::Reverse {
                source_ns: "posts".to_string(),
                forward: "author".to_string(),
            },
        );
        backend.set_schema("users", users_schema).await.unwrap();

        backend
            .create("users", Some("u1".into()), doc! {"name" => "jane"}, &WriteOptions::default())
            .await
            .unwrap();
        backend
            .create(
                "posts",
                Some("p1".into()),
                doc! {"title" => "x", "author" => "users/u1"},
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        let u1 = EntityId::new("users", "u1").unwrap();
        let related = backend.get_related(&u1, "posts").await.unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id.canonical(), "posts/p1");
    }

    #[tokio::test]
    async fn capabilities() {
        let (_store, backend) = backend().await;
        assert_eq!(backend.type_name(), "iceberg");
        assert!(!backend.supports_time_travel());
        assert!(backend.supports_schema_evolution());

        let id = EntityId::new("posts", "p1").unwrap();
        let err = backend
            .get(
                &id,
                &ReadOptions {
                    at: Some(1_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation { .. });
    }
}
