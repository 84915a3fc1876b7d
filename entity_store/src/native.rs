use crate::{
    extract_forward_links, AlreadyExistsSnafu, BackendStats, CodecSnafu, DeleteOptions,
    EntityBackend, Error, EventsSnafu, FindOptions, ForwardLink, InvalidIdSnafu, ManifestStore,
    NamespaceStats, NotDeletedSnafu, NotFoundSnafu, ReadOptions, RelationshipIndex, Result,
    StoreSnafu, TransactionalBackend, UniqueConstraintSnafu, UpdateDoc, UpdateOptions,
    VersionMismatchSnafu, WriteOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use columnar::ColumnarCodec;
use data_types::{
    Document, Entity, EntityId, Event, EventOp, NamespaceSchema, Value,
};
use db_time::TimeProvider;
use event_log::{snapshot::SnapshotStore, EventLog};
use index::{DocLocation, HashIndex, IndexKey};
use object_store::{ObjectStore, Path};
use predicate::{analyze_filter_for_pushdown, matches_filter, may_match, Filter};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Native layout knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeConfig {
    /// Fail every mutating entry point before any side effect.
    pub read_only: bool,
    /// Auto-snapshot an entity every this-many versions (0 disables).
    pub auto_snapshot_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UniqueIndexDef {
    name: String,
    field: String,
    sparse: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tombstones {
    purged: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct NamespaceState {
    loaded: bool,
    schema: NamespaceSchema,
    // newest in-memory versions, authoritative over segments
    dirty: BTreeMap<String, Entity>,
    // hard-deleted local ids masking older segment rows
    purged: BTreeSet<String>,
    unique_defs: Vec<UniqueIndexDef>,
    unique: BTreeMap<String, HashIndex>,
}

#[derive(Debug, Default)]
struct WorkingSet {
    namespaces: BTreeMap<String, NamespaceState>,
    reverse: RelationshipIndex,
}

/// The native layout: `data/<ns>/*.parquet` segments, a per-namespace
/// `manifest.json`, events through the shared log, snapshots for
/// time-travel acceleration.
///
/// Mutations run in a single-writer critical section spanning version
/// check, unique-index enforcement, working-set update and event append;
/// readers merge durable segments (pruned by pushdown predicates) with
/// the in-memory working set.
#[derive(Debug)]
pub struct NativeBackend {
    store: Arc<dyn ObjectStore>,
    codec: Arc<dyn ColumnarCodec>,
    time_provider: Arc<dyn TimeProvider>,
    events: Arc<EventLog>,
    snapshots: Arc<SnapshotStore>,
    manifests: ManifestStore,
    config: NativeConfig,
    state: RwLock<WorkingSet>,
}

fn ns_prefix(ns: &str) -> Path {
    Path::parse(format!("data/{ns}")).expect("namespace names are validated")
}

fn manifest_path(ns: &str) -> Path {
    Path::parse(format!("data/{ns}/manifest.json")).expect("namespace names are validated")
}

fn tombstones_path(ns: &str) -> Path {
    Path::parse(format!("data/{ns}/tombstones.json")).expect("namespace names are validated")
}

fn is_segment(path: &Path) -> bool {
    let name = path.file_name();
    name.ends_with(".parquet") && !name.ends_with(".partial.parquet")
}

impl NativeBackend {
    /// Open (or initialize) a native backend.
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        codec: Arc<dyn ColumnarCodec>,
        time_provider: Arc<dyn TimeProvider>,
        events: Arc<EventLog>,
        snapshots: Arc<SnapshotStore>,
        config: NativeConfig,
    ) -> Result<Self> {
        let backend = Self {
            manifests: ManifestStore::new(Arc::clone(&store)),
            store,
            codec,
            time_provider,
            events,
            snapshots,
            config,
            state: RwLock::new(WorkingSet::default()),
        };
        backend.rebuild_reverse_index().await?;
        Ok(backend)
    }

    fn now_ms(&self) -> i64 {
        self.time_provider.now().timestamp_millis()
    }

    fn check_writable(&self) -> Result<()> {
        ensure!(!self.config.read_only, crate::ReadOnlySnafu);
        Ok(())
    }

    /// Declare a unique hash index over a flat field of `ns`, building it
    /// from the existing entities (all-or-nothing on duplicates).
    pub async fn create_unique_index(
        &self,
        ns: &str,
        name: &str,
        field: &str,
        sparse: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        self.ensure_loaded(&mut state, ns).await?;

        let existing = self.collect_namespace(&state, ns, &[]).await?;
        let mut index = HashIndex::new(name, true, sparse);
        let items = existing
            .values()
            .filter(|e| !e.meta.is_deleted())
            .map(|e| {
                (
                    IndexKey::single(e.body.get(field).cloned().unwrap_or(Value::Null)),
                    DocLocation::new(e.id.canonical(), 0, 0),
                )
            })
            .collect();
        index.build_from_array(items).context(UniqueConstraintSnafu)?;

        let ns_state = state.namespaces.get_mut(ns).expect("loaded above");
        ns_state.unique_defs.push(UniqueIndexDef {
            name: name.to_string(),
            field: field.to_string(),
            sparse,
        });
        ns_state.unique.insert(name.to_string(), index);
        info!(ns, name, field, "unique index created");
        Ok(())
    }

    async fn ensure_loaded(&self, state: &mut WorkingSet, ns: &str) -> Result<()> {
        let ns_state = state.namespaces.entry(ns.to_string()).or_default();
        if ns_state.loaded {
            return Ok(());
        }
        let (manifest, _) = self.manifests.load(&manifest_path(ns)).await?;
        if let Some(schema) = manifest.schema {
            ns_state.schema = schema;
        }
        match self.store.read(&tombstones_path(ns)).await {
            Ok(raw) => {
                let tombstones: Tombstones =
                    serde_json::from_slice(&raw).unwrap_or_default();
                ns_state.purged = tombstones.purged;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(StoreSnafu),
        }
        ns_state.loaded = true;
        Ok(())
    }

    /// Decode the durable segments of `ns`, pruning files whose stats
    /// rule out `predicates`, folding rows to the newest version per id.
    async fn scan_segments(
        &self,
        ns: &str,
        predicates: &[predicate::ColumnPredicate],
    ) -> Result<BTreeMap<String, Entity>> {
        let entries = self
            .store
            .list_all(&ns_prefix(ns))
            .await
            .context(StoreSnafu)?;

        let mut out: BTreeMap<String, Entity> = BTreeMap::new();
        let mut pruned = 0usize;
        for entry in entries {
            if !is_segment(&entry.path) {
                continue;
            }
            let bytes = self.store.read(&entry.path).await.context(StoreSnafu)?;
            if !predicates.is_empty() {
                let stats = self.codec.read_stats(&bytes).context(CodecSnafu)?;
                if !may_match(&stats, predicates) {
                    pruned += 1;
                    continue;
                }
            }
            let rows = self.codec.decode_rows(&bytes).context(CodecSnafu)?;
            for row in rows {
                let Some(entity) = Entity::from_full_document(row) else {
                    continue;
                };
                let local = entity.id.local_id().to_string();
                match out.get(&local) {
                    Some(existing) if existing.meta.version >= entity.meta.version => {}
                    _ => {
                        out.insert(local, entity);
                    }
                }
            }
        }
        if pruned > 0 {
            debug!(ns, pruned, "segments pruned by pushdown statistics");
        }
        Ok(out)
    }

    /// Segments overlaid with the working set, purged ids masked.
    async fn collect_namespace(
        &self,
        state: &WorkingSet,
        ns: &str,
        predicates: &[predicate::ColumnPredicate],
    ) -> Result<BTreeMap<String, Entity>> {
        let mut merged = self.scan_segments(ns, predicates).await?;
        if let Some(ns_state) = state.namespaces.get(ns) {
            for (local, entity) in &ns_state.dirty {
                merged.insert(local.clone(), entity.clone());
            }
            for local in &ns_state.purged {
                merged.remove(local);
            }
        }
        Ok(merged)
    }

    async fn lookup(&self, state: &WorkingSet, id: &EntityId) -> Result<Option<Entity>> {
        if let Some(ns_state) = state.namespaces.get(id.namespace()) {
            if ns_state.purged.contains(id.local_id()) {
                return Ok(None);
            }
            if let Some(entity) = ns_state.dirty.get(id.local_id()) {
                return Ok(Some(entity.clone()));
            }
        }
        let merged = self.scan_segments(id.namespace(), &[]).await?;
        Ok(merged.get(id.local_id()).cloned())
    }

    fn schema_of(state: &WorkingSet, ns: &str) -> NamespaceSchema {
        state
            .namespaces
            .get(ns)
            .map(|s| s.schema.clone())
            .unwrap_or_default()
    }

    fn links_of(state: &WorkingSet, entity: &Entity) -> Vec<ForwardLink> {
        let schema = Self::schema_of(state, entity.id.namespace());
        extract_forward_links(&schema, &entity.body)
    }

    /// Enforce declared unique indexes for a transition `before -> after`
    /// of one entity, updating the index entries on success.
    fn apply_unique(
        ns_state: &mut NamespaceState,
        id: &EntityId,
        before: Option<&Document>,
        after: Option<&Document>,
    ) -> Result<()> {
        let canonical = id.canonical();
        let defs = ns_state.unique_defs.clone();
        for def in defs {
            let index = ns_state
                .unique
                .get_mut(&def.name)
                .expect("defs and indexes stay in sync");
            let old_key = before
                .map(|b| IndexKey::single(b.get(&def.field).cloned().unwrap_or(Value::Null)));
            let new_key = after
                .map(|a| IndexKey::single(a.get(&def.field).cloned().unwrap_or(Value::Null)));

            if old_key == new_key {
                continue;
            }
            if let Some(new_key) = &new_key {
                if !index.check_unique(new_key, Some(&canonical)) {
                    return Err(Error::UniqueConstraint {
                        source: index::Error::UniqueConstraint {
                            index_name: def.name.clone(),
                            value: new_key.encode(),
                        },
                    });
                }
            }
            if let Some(old_key) = old_key {
                index.remove(&old_key, &canonical);
            }
            if let Some(new_key) = new_key {
                index
                    .insert(new_key, DocLocation::new(canonical.clone(), 0, 0))
                    .context(UniqueConstraintSnafu)?;
            }
        }
        Ok(())
    }

    /// Event timestamp: wall clock, nudged past the entity's last update
    /// so per-entity event order stays strict.
    fn event_ts(&self, previous: Option<&Entity>) -> i64 {
        let now = self.now_ms();
        match previous {
            Some(entity) => now.max(entity.meta.updated_at + 1),
            None => now,
        }
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

    async fn maybe_snapshot(&self, id: &EntityId, version: u64) -> Result<()> {
        let threshold = self.config.auto_snapshot_threshold;
        if threshold == 0 || version % threshold != 0 {
            return Ok(());
        }
        let history = self.events.get_history(id).await.context(EventsSnafu)?;
        self.snapshots
            .maybe_auto_snapshot(id.namespace(), id.local_id(), &history, self.now_ms())
            .await
            .context(EventsSnafu)?;
        Ok(())
    }

    async fn rebuild_reverse_index(&self) -> Result<()> {
        let namespaces = self.list_namespaces().await?;
        let mut state = self.state.write().await;
        for ns in &namespaces {
            self.ensure_loaded(&mut state, ns).await?;
        }

        let mut rebuilt = RelationshipIndex::new();
        for ns in &namespaces {
            let schema = Self::schema_of(&state, ns);
            let entities = self.collect_namespace(&state, ns, &[]).await?;
            for entity in entities.values() {
                if entity.meta.is_deleted() {
                    continue;
                }
                let links = extract_forward_links(&schema, &entity.body);
                rebuilt.add_links(&entity.id, &links);
            }
        }
        state.reverse = rebuilt;
        Ok(())
    }

    /// The create path shared by [`EntityBackend::create`] and
    /// [`TransactionalBackend::stage_create`].
    async fn apply_create(
        &self,
        ns: &str,
        id: Option<String>,
        body: Document,
        actor: Option<String>,
    ) -> Result<Entity> {
        self.check_writable()?;
        let entity_id = match id {
            Some(local) => EntityId::new(ns, local).context(InvalidIdSnafu)?,
            None => EntityId::generate(ns).context(InvalidIdSnafu)?,
        };

        let mut state = self.state.write().await;
        self.ensure_loaded(&mut state, ns).await?;

        let existing = self.lookup(&state, &entity_id).await?;
        ensure!(
            existing.is_none(),
            AlreadyExistsSnafu {
                id: entity_id.canonical(),
            }
        );

        let ts = self.event_ts(None);
        let mut entity = Entity::new(entity_id.clone(), body, ts, actor);
        entity.meta.entity_type = Self::schema_of(&state, ns).entity_type;

        let ns_state = state.namespaces.get_mut(ns).expect("loaded above");
        Self::apply_unique(ns_state, &entity_id, None, Some(&entity.body))?;
        ns_state.purged.remove(entity_id.local_id());
        ns_state.dirty.insert(entity_id.local_id().to_string(), entity.clone());

        let links = Self::links_of(&state, &entity);
        state.reverse.add_links(&entity_id, &links);

        Ok(entity)
    }

    /// The update path shared by [`EntityBackend::update`] and
    /// [`TransactionalBackend::stage_update`].
    async fn apply_update(
        &self,
        id: &EntityId,
        update: &UpdateDoc,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<(Entity, Entity)> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        self.ensure_loaded(&mut state, id.namespace()).await?;

        let before = self
            .lookup(&state, id)
            .await?
            .filter(|e| !e.meta.is_deleted())
            .context(NotFoundSnafu { id: id.canonical() })?;

        if let Some(expected) = expected_version {
            ensure!(
                before.meta.version == expected,
                VersionMismatchSnafu {
                    id: id.canonical(),
                    expected,
                    actual: before.meta.version,
                }
            );
        }

        let new_body = update.apply(&before.body)?;
        let ts = self.event_ts(Some(&before));

        let mut after = before.clone();
        after.body = new_body;
        after.meta.version += 1;
        after.meta.updated_at = ts;
        after.meta.updated_by = actor;

        let ns_state = state
            .namespaces
            .get_mut(id.namespace())
            .expect("loaded above");
        Self::apply_unique(ns_state, id, Some(&before.body), Some(&after.body))?;
        ns_state.dirty.insert(id.local_id().to_string(), after.clone());

        let old_links = Self::links_of(&state, &before);
        let new_links = Self::links_of(&state, &after);
        state.reverse.replace_links(id, &old_links, &new_links);

        Ok((before, after))
    }

    /// The soft-delete path shared by delete and
    /// [`TransactionalBackend::stage_delete`].
    async fn apply_soft_delete(
        &self,
        id: &EntityId,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<(Entity, Entity)> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        self.ensure_loaded(&mut state, id.namespace()).await?;

        let before = self
            .lookup(&state, id)
            .await?
            .filter(|e| !e.meta.is_deleted())
            .context(NotFoundSnafu { id: id.canonical() })?;
        if let Some(expected) = expected_version {
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
        after.meta.version += 1;
        after.meta.updated_at = ts;
        after.meta.deleted_at = Some(ts);
        after.meta.deleted_by = actor;

        let ns_state = state
            .namespaces
            .get_mut(id.namespace())
            .expect("loaded above");
        // soft-deleted entities release their unique keys and reverse
        // entries; restore re-acquires both
        Self::apply_unique(ns_state, id, Some(&before.body), None)?;
        ns_state.dirty.insert(id.local_id().to_string(), after.clone());

        let links = Self::links_of(&state, &before);
        state.reverse.remove_links(id, &links);

        Ok((before, after))
    }
}

#[async_trait]
impl EntityBackend for NativeBackend {
    fn type_name(&self) -> &'static str {
        "native"
    }

    fn supports_time_travel(&self) -> bool {
        true
    }

    fn supports_schema_evolution(&self) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        self.config.read_only
    }

    async fn create(
        &self,
        ns: &str,
        id: Option<String>,
        body: Document,
        options: &WriteOptions,
    ) -> Result<Entity> {
        let entity = self
            .apply_create(ns, id, body, options.actor.clone())
            .await?;
        self.record_event(
            EventOp::Create,
            &entity.id,
            entity.meta.created_at,
            options.actor.clone(),
            None,
            Some(entity.to_full_document()),
        )
        .await?;
        self.maybe_snapshot(&entity.id, entity.meta.version).await?;
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
        if let Some(at) = options.at {
            let history = self.events.get_history(id).await.context(EventsSnafu)?;
            let (result, stats) = self
                .snapshots
                .replay_at(id.namespace(), id.local_id(), &history, at)
                .await
                .context(EventsSnafu)?;
            debug!(
                id = %id,
                at,
                events_replayed = stats.events_replayed,
                snapshot_used_at = ?stats.snapshot_used_at,
                "time-travel read"
            );
            let entity = result.state.and_then(Entity::from_full_document);
            return Ok(entity.filter(|e| options.include_deleted || !e.meta.is_deleted()));
        }

        let state = self.state.read().await;
        let entity = self.lookup(&state, id).await?;
        Ok(entity.filter(|e| options.include_deleted || !e.meta.is_deleted()))
    }

    async fn find(&self, ns: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Entity>> {
        let state = self.state.read().await;
        let schema = Self::schema_of(&state, ns);
        let analysis = analyze_filter_for_pushdown(filter, &schema.typed_columns);

        let merged = self
            .collect_namespace(&state, ns, &analysis.pushdown_predicates)
            .await?;
        drop(state);

        let mut results: Vec<Entity> = merged
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
        let (before, after) = self
            .apply_update(id, update, options.expected_version, options.actor.clone())
            .await?;
        self.record_event(
            EventOp::Update,
            id,
            after.meta.updated_at,
            options.actor.clone(),
            Some(before.to_full_document()),
            Some(after.to_full_document()),
        )
        .await?;
        self.maybe_snapshot(id, after.meta.version).await?;
        Ok(after)
    }

    async fn bulk_update(
        &self,
        ns: &str,
        filter: &Filter,
        update: &UpdateDoc,
        options: &UpdateOptions,
    ) -> Result<u64> {
        let matches = self
            .find(ns, filter, &FindOptions::default())
            .await?;
        let mut changed = 0;
        for entity in matches {
            self.update(&entity.id, update, options).await?;
            changed += 1;
        }
        Ok(changed)
    }

    async fn delete(&self, id: &EntityId, options: &DeleteOptions) -> Result<bool> {
        self.check_writable()?;

        if options.hard {
            let mut state = self.state.write().await;
            self.ensure_loaded(&mut state, id.namespace()).await?;
            let Some(before) = self.lookup(&state, id).await? else {
                return Ok(false);
            };
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

            let links = Self::links_of(&state, &before);
            state.reverse.remove_links(id, &links);
            let ns_state = state
                .namespaces
                .get_mut(id.namespace())
                .expect("loaded above");
            if !before.meta.is_deleted() {
                Self::apply_unique(ns_state, id, Some(&before.body), None)?;
            }
            ns_state.dirty.remove(id.local_id());
            ns_state.purged.insert(id.local_id().to_string());
            drop(state);

            // hard delete erases storage; snapshots stay for audit
            self.record_event(
                EventOp::Delete,
                id,
                ts,
                options.actor.clone(),
                Some(before.to_full_document()),
                None,
            )
            .await?;
            info!(id = %id, "hard-deleted entity");
            return Ok(true);
        }

        match self
            .apply_soft_delete(id, options.expected_version, options.actor.clone())
            .await
        {
            Ok((before, after)) => {
                // soft delete replays as an update so the state (with its
                // deletion markers) survives the fold
                self.record_event(
                    EventOp::Update,
                    id,
                    after.meta.updated_at,
                    options.actor.clone(),
                    Some(before.to_full_document()),
                    Some(after.to_full_document()),
                )
                .await?;
                Ok(true)
            }
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
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
        let mut state = self.state.write().await;
        self.ensure_loaded(&mut state, id.namespace()).await?;

        let before = self
            .lookup(&state, id)
            .await?
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

        let ns_state = state
            .namespaces
            .get_mut(id.namespace())
            .expect("loaded above");
        Self::apply_unique(ns_state, id, None, Some(&after.body))?;
        ns_state.dirty.insert(id.local_id().to_string(), after.clone());

        let links = Self::links_of(&state, &after);
        state.reverse.add_links(id, &links);
        drop(state);

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
        let mut state = self.state.write().await;
        self.ensure_loaded(&mut state, ns).await?;
        Ok(Some(Self::schema_of(&state, ns)))
    }

    async fn set_schema(&self, ns: &str, schema: NamespaceSchema) -> Result<()> {
        self.check_writable()?;
        {
            let mut state = self.state.write().await;
            self.ensure_loaded(&mut state, ns).await?;
            state
                .namespaces
                .get_mut(ns)
                .expect("loaded above")
                .schema = schema.clone();
        }
        self.manifests
            .update(&manifest_path(ns), move |m| {
                m.schema = Some(schema.clone());
            })
            .await?;
        // relationship declarations may have changed
        self.rebuild_reverse_index().await
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let mut namespaces: BTreeSet<String> = {
            let state = self.state.read().await;
            state.namespaces.keys().cloned().collect()
        };
        let entries = self
            .store
            .list_all(&Path::parse("data").expect("static path"))
            .await
            .context(StoreSnafu)?;
        for entry in entries {
            let raw = entry.path.as_str();
            if let Some(rest) = raw.strip_prefix("data/") {
                if let Some((ns, _)) = rest.split_once('/') {
                    namespaces.insert(ns.to_string());
                }
            }
        }
        Ok(namespaces.into_iter().collect())
    }

    async fn stats(&self) -> Result<BackendStats> {
        let namespaces = self.list_namespaces().await?;
        let state = self.state.read().await;

        let mut stats = BackendStats::default();
        for ns in namespaces {
            let merged = self.collect_namespace(&state, &ns, &[]).await?;
            let deleted = merged.values().filter(|e| e.meta.is_deleted()).count() as u64;

            let mut files = 0;
            let mut bytes = 0;
            for entry in self
                .store
                .list_all(&ns_prefix(&ns))
                .await
                .context(StoreSnafu)?
            {
                if is_segment(&entry.path) {
                    files += 1;
                    bytes += entry.size;
                }
            }
            stats.namespaces.insert(
                ns,
                NamespaceStats {
                    entities: merged.len() as u64 - deleted,
                    deleted,
                    files,
                    bytes,
                },
            );
        }
        Ok(stats)
    }

    async fn get_related(&self, target: &EntityId, relation: &str) -> Result<Vec<Entity>> {
        let sources = {
            let state = self.state.read().await;
            state.reverse.sources(target, relation)
        };
        let mut related = vec![];
        for canonical in sources {
            let id = EntityId::parse_canonical(&canonical).context(InvalidIdSnafu)?;
            if let Some(entity) = self.get(&id, &ReadOptions::default()).await? {
                related.push(entity);
            }
        }
        Ok(related)
    }

    async fn flush(&self) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let namespaces: Vec<String> = state
            .namespaces
            .iter()
            .filter(|(_, s)| !s.dirty.is_empty() || !s.purged.is_empty())
            .map(|(ns, _)| ns.clone())
            .collect();

        for ns in namespaces {
            let ns_state = state.namespaces.get_mut(&ns).expect("listed above");
            if !ns_state.dirty.is_empty() {
                let rows: Vec<Document> = ns_state
                    .dirty
                    .values()
                    .map(Entity::to_full_document)
                    .collect();
                let encoded = self
                    .codec
                    .encode_rows(&ns_state.schema, &rows)
                    .context(CodecSnafu)?;

                let file_name = format!("part-{}-{}.parquet", self.now_ms(), Uuid::new_v4().simple());
                let path = ns_prefix(&ns).join(&file_name).expect("valid file name");
                self.store
                    .write_atomic(&path, encoded.bytes.clone())
                    .await
                    .context(StoreSnafu)?;

                let size = encoded.bytes.len() as u64;
                let hash = ManifestStore::content_hash(&encoded.bytes);
                let file_path = path.as_str().to_string();
                self.manifests
                    .update(&manifest_path(&ns), move |m| {
                        m.files.push(data_types::ManifestFile {
                            path: file_path.clone(),
                            size_bytes: size,
                            content_hash: hash.clone(),
                        });
                    })
                    .await?;
                info!(ns = ns.as_str(), rows = rows.len(), path = %path, "flushed segment");
                ns_state.dirty.clear();
            }

            let tombstones = Tombstones {
                purged: ns_state.purged.clone(),
            };
            self.store
                .write_atomic(
                    &tombstones_path(&ns),
                    Bytes::from(serde_json::to_vec(&tombstones).expect("serializes")),
                )
                .await
                .context(StoreSnafu)?;
        }
        drop(state);

        self.events.flush().await.context(EventsSnafu)
    }
}

#[async_trait]
impl TransactionalBackend for NativeBackend {
    async fn stage_create(
        &self,
        ns: &str,
        id: Option<String>,
        body: Document,
        actor: Option<String>,
    ) -> Result<Entity> {
        self.apply_create(ns, id, body, actor).await
    }

    async fn stage_update(
        &self,
        id: &EntityId,
        update: &UpdateDoc,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<(Entity, Entity)> {
        self.apply_update(id, update, expected_version, actor).await
    }

    async fn stage_delete(
        &self,
        id: &EntityId,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<(Entity, Entity)> {
        self.apply_soft_delete(id, expected_version, actor).await
    }

    async fn unstage_create(&self, id: &EntityId) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(entity) = state
            .namespaces
            .get(id.namespace())
            .and_then(|s| s.dirty.get(id.local_id()))
            .cloned()
        else {
            return Ok(());
        };

        let links = Self::links_of(&state, &entity);
        state.reverse.remove_links(id, &links);

        let ns_state = state
            .namespaces
            .get_mut(id.namespace())
            .expect("staged namespaces are loaded");
        Self::apply_unique(ns_state, id, Some(&entity.body), None)?;
        ns_state.dirty.remove(id.local_id());
        Ok(())
    }

    async fn unstage_update(&self, before: Entity) -> Result<()> {
        let mut state = self.state.write().await;
        let id = before.id.clone();
        let current = state
            .namespaces
            .get(id.namespace())
            .and_then(|s| s.dirty.get(id.local_id()))
            .cloned();

        if let Some(current) = &current {
            let current_links = Self::links_of(&state, current);
            let before_links = Self::links_of(&state, &before);
            state
                .reverse
                .replace_links(&id, &current_links, &before_links);
        }

        let ns_state = state
            .namespaces
            .get_mut(id.namespace())
            .expect("staged namespaces are loaded");
        Self::apply_unique(
            ns_state,
            &id,
            current.as_ref().map(|c| &c.body),
            Some(&before.body),
        )?;
        ns_state
            .dirty
            .insert(id.local_id().to_string(), before);
        Ok(())
    }

    async fn unstage_delete(&self, before: Entity) -> Result<()> {
        let mut state = self.state.write().await;
        let id = before.id.clone();

        let links = Self::links_of(&state, &before);
        state.reverse.add_links(&id, &links);

        let ns_state = state
            .namespaces
            .get_mut(id.namespace())
            .expect("staged namespaces are loaded");
        Self::apply_unique(ns_state, &id, None, Some(&before.body))?;
        ns_state
            .dirty
            .insert(id.local_id().to_string(), before);
        Ok(())
    }

    async fn commit_events(&self, events: Vec<Event>) -> Result<()> {
        self.events.append_many(events).await.context(EventsSnafu)
    }

    async fn current_version(&self, id: &EntityId) -> Result<Option<u64>> {
        let state = self.state.read().await;
        Ok(self.lookup(&state, id).await?.map(|e| e.meta.version))
    }
}
