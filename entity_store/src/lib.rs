//! Entity storage: MongoDB-style CRUD over columnar segments.
//!
//! Two on-disk layouts implement the same [`EntityBackend`] contract: the
//! native layout (`data/<ns>/*.parquet` plus a per-namespace manifest)
//! and the iceberg-style layout (`warehouse/<db>/<ns>/...` with numbered
//! metadata snapshots and a `version-hint.txt`). Every mutation records an
//! event; reads at a timestamp replay events, accelerated by snapshots.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod iceberg;
mod manifest;
mod native;
mod relationships;
mod update;
mod validation;

pub use iceberg::IcebergBackend;
pub use manifest::ManifestStore;
pub use native::{NativeBackend, NativeConfig};
pub use relationships::{extract_forward_links, ForwardLink, RelationshipIndex};
pub use update::UpdateDoc;
pub use validation::{validate_batch, validate_batch_strict, InvalidDocument, ValidationSplit};

use async_trait::async_trait;
use data_types::{Document, Entity, EntityId, NamespaceSchema};
use predicate::Filter;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Entity-layer errors; object-store failures are translated into these
/// domain kinds at this boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("entity {} not found", id))]
    NotFound { id: String },

    #[snafu(display("entity {} already exists", id))]
    AlreadyExists { id: String },

    #[snafu(display(
        "version mismatch on {}: expected {}, stored {}",
        id,
        expected,
        actual
    ))]
    VersionMismatch {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("backend is read-only"))]
    ReadOnly,

    #[snafu(display("{}", source))]
    UniqueConstraint { source: index::Error },

    #[snafu(display("entity {} is not soft-deleted", id))]
    NotDeleted { id: String },

    #[snafu(display("invalid input: {}", reason))]
    Validation { reason: String },

    #[snafu(display("invalid id: {}", source))]
    InvalidId { source: data_types::IdError },

    #[snafu(display("object store failure: {}", source))]
    Store { source: object_store::Error },

    #[snafu(display("codec failure: {}", source))]
    Codec { source: columnar::Error },

    #[snafu(display("event log failure: {}", source))]
    Events { source: event_log::Error },

    #[snafu(display("manifest update conflicted: {}", source))]
    ManifestConflict { source: object_store::Error },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Expose soft-deleted entities.
    pub include_deleted: bool,
    /// Read the state as of this timestamp (event replay).
    pub at: Option<i64>,
}

/// Options for `find`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FindOptions {
    /// Expose soft-deleted entities.
    pub include_deleted: bool,
    /// Cap the result count.
    pub limit: Option<usize>,
}

/// Options for writes.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Actor recorded on the entity and its event.
    pub actor: Option<String>,
}

/// Options for updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Optimistic concurrency: abort unless the stored version matches.
    pub expected_version: Option<u64>,
    /// Actor recorded on the entity and its event.
    pub actor: Option<String>,
}

/// Options for deletes.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Erase storage instead of soft-deleting. Irreversible.
    pub hard: bool,
    /// Optimistic concurrency: abort unless the stored version matches.
    pub expected_version: Option<u64>,
    /// Actor recorded on the event (and `deletedBy` for soft deletes).
    pub actor: Option<String>,
}

/// Per-namespace counters reported by [`EntityBackend::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    /// Live (non-deleted) entities.
    pub entities: u64,
    /// Soft-deleted entities still present.
    pub deleted: u64,
    /// Data files on disk.
    pub files: u64,
    /// Bytes across the data files.
    pub bytes: u64,
}

/// Whole-backend counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Stats per namespace.
    pub namespaces: BTreeMap<String, NamespaceStats>,
}

/// The storage contract both layouts implement.
#[async_trait]
pub trait EntityBackend: Debug + Send + Sync + 'static {
    /// Layout name (`"native"` / `"iceberg"`).
    fn type_name(&self) -> &'static str;

    /// Whether reads accept [`ReadOptions::at`].
    fn supports_time_travel(&self) -> bool;

    /// Whether namespace schemas may change after creation.
    fn supports_schema_evolution(&self) -> bool;

    /// Whether every mutating entry point fails with
    /// [`Error::ReadOnly`].
    fn read_only(&self) -> bool;

    /// Create one entity; a caller-supplied local id makes this an
    /// upsert-style create-at-id.
    async fn create(
        &self,
        ns: &str,
        id: Option<String>,
        body: Document,
        options: &WriteOptions,
    ) -> Result<Entity>;

    /// Create many entities.
    async fn bulk_create(
        &self,
        ns: &str,
        bodies: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<Vec<Entity>>;

    /// Fetch one entity.
    async fn get(&self, id: &EntityId, options: &ReadOptions) -> Result<Option<Entity>>;

    /// Filtered scan over one namespace.
    async fn find(&self, ns: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Entity>>;

    /// Apply update operators to one entity.
    async fn update(
        &self,
        id: &EntityId,
        update: &UpdateDoc,
        options: &UpdateOptions,
    ) -> Result<Entity>;

    /// Apply update operators to every match; returns how many changed.
    async fn bulk_update(
        &self,
        ns: &str,
        filter: &Filter,
        update: &UpdateDoc,
        options: &UpdateOptions,
    ) -> Result<u64>;

    /// Soft- or hard-delete one entity; `false` when it did not exist.
    async fn delete(&self, id: &EntityId, options: &DeleteOptions) -> Result<bool>;

    /// Delete every match; returns how many went away.
    async fn bulk_delete(&self, ns: &str, filter: &Filter, options: &DeleteOptions)
        -> Result<u64>;

    /// Undo a soft delete; bumps the version.
    async fn restore(&self, id: &EntityId) -> Result<Entity>;

    /// Declared schema of a namespace.
    async fn get_schema(&self, ns: &str) -> Result<Option<NamespaceSchema>>;

    /// Declare (or evolve) a namespace schema.
    async fn set_schema(&self, ns: &str, schema: NamespaceSchema) -> Result<()>;

    /// Known namespaces.
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Counters.
    async fn stats(&self) -> Result<BackendStats>;

    /// Entities holding a forward link `relation` to `target`, served by
    /// the reverse relationship index.
    async fn get_related(&self, target: &EntityId, relation: &str) -> Result<Vec<Entity>>;

    /// Persist the working set as columnar segments.
    async fn flush(&self) -> Result<()>;
}

/// Staged-write surface the transaction manager drives.
///
/// Staged mutations are visible in the shared views immediately (so
/// mid-transaction reads see them) but write no events; the manager
/// either publishes events on commit or calls the `unstage_*` inverses on
/// rollback.
#[async_trait]
pub trait TransactionalBackend: EntityBackend {
    /// Stage a create.
    async fn stage_create(
        &self,
        ns: &str,
        id: Option<String>,
        body: Document,
        actor: Option<String>,
    ) -> Result<Entity>;

    /// Stage an update, returning the pre- and post-images.
    async fn stage_update(
        &self,
        id: &EntityId,
        update: &UpdateDoc,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<(Entity, Entity)>;

    /// Stage a (soft) delete, returning the pre- and post-images.
    async fn stage_delete(
        &self,
        id: &EntityId,
        expected_version: Option<u64>,
        actor: Option<String>,
    ) -> Result<(Entity, Entity)>;

    /// Roll back a staged create: the entity vanishes and every reverse
    /// index entry induced by its forward links is dropped.
    async fn unstage_create(&self, id: &EntityId) -> Result<()>;

    /// Roll back a staged update: restore the pre-image, including the
    /// reverse-index repair for changed forward links.
    async fn unstage_update(&self, before: Entity) -> Result<()>;

    /// Roll back a staged delete: reinstate the pre-image and re-index
    /// its forward links.
    async fn unstage_delete(&self, before: Entity) -> Result<()>;

    /// Publish the events of a committed transaction.
    async fn commit_events(&self, events: Vec<data_types::Event>) -> Result<()>;

    /// Stored version of an entity, if it exists.
    async fn current_version(&self, id: &EntityId) -> Result<Option<u64>>;
}
