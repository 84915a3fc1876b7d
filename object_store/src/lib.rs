//! Pluggable byte-blob storage.
//!
//! Every backend (in-memory, local filesystem, remote HTTP) exposes the
//! same [`ObjectStore`] contract: range reads, paginated listing, atomic
//! and ETag-conditional writes. Conditional writes are the basis of
//! cross-process safety for manifest and snapshot-pointer updates.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod local;
mod memory;
mod path;
mod remote;

pub use local::LocalFileSystem;
pub use memory::InMemory;
pub use path::Path;
pub use remote::{RemoteConfig, RemoteHttpStore};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::{Debug, Display, Formatter};

/// Semantic class of a store failure, common to all backends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The object or directory does not exist.
    NotFound,
    /// Creation collided with an existing object.
    AlreadyExists,
    /// A conditional write's precondition failed.
    ETagMismatch,
    /// The backend refused access.
    PermissionDenied,
    /// The path failed validation (including traversal attempts).
    InvalidPath,
    /// Transport-level failure talking to a remote backend.
    Network,
    /// The backend is out of space or over quota.
    Quota,
    /// `rmdir` on a non-empty directory.
    DirectoryNotEmpty,
    /// Anything else.
    Unknown,
}

/// Generic store error carrying the failure kind, the path involved and an
/// optional underlying cause.
///
/// The dynamic boxing makes it easy to funnel errors from different
/// backends through one type.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    path: Option<String>,
    context: Option<String>,
    inner: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Create a new error of `kind` for `path`.
    pub fn new(kind: ErrorKind, path: Option<String>) -> Self {
        Self {
            kind,
            path,
            context: None,
            inner: None,
        }
    }

    /// Attach a human-readable context message.
    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.inner = Some(source.into());
        self
    }

    /// The failure kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The path involved, if known.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// True if the object was missing.
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// True if a conditional write's precondition failed.
    pub fn is_precondition_failed(&self) -> bool {
        self.kind == ErrorKind::ETagMismatch
    }

    /// True for write conflicts (existing object or ETag mismatch).
    pub fn is_conflict(&self) -> bool {
        matches!(self.kind, ErrorKind::AlreadyExists | ErrorKind::ETagMismatch)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStoreError({:?})", self.kind)?;
        if let Some(path) = &self.path {
            write!(f, " at {path:?}")?;
        }
        if let Some(context) = &self.context {
            write!(f, ": {context}")?;
        }
        if let Some(inner) = &self.inner {
            write!(f, ": {inner}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Store result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Size in bytes.
    pub size: u64,
    /// Last modification, ms since epoch.
    pub mtime: i64,
    /// Backend-specific entity tag, if the backend versions objects.
    pub etag: Option<String>,
}

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Full store-relative path.
    pub path: Path,
    /// Size in bytes.
    pub size: u64,
}

/// A single page of listing results.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Objects in this page, path-ordered.
    pub objects: Vec<ObjectEntry>,
    /// Opaque continuation token; `None` when the listing is complete.
    pub next_token: Option<String>,
}

/// Byte-range request mode for [`ObjectStore::read_range`].
///
/// A non-negative `start` selects the half-open interval `[start, end)`.
/// A negative `start` is a distinct suffix mode selecting the last
/// `-start` bytes; `end` is ignored there.
pub fn range_header_value(start: i64, end: i64) -> String {
    if start < 0 {
        // suffix mode, e.g. bytes=-3 for the last three bytes
        format!("bytes={start}")
    } else {
        // HTTP ranges are inclusive of the last byte
        format!("bytes={}-{}", start, end - 1)
    }
}

/// The pluggable byte-blob store contract.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync + 'static {
    /// Read the full object.
    async fn read(&self, path: &Path) -> Result<Bytes>;

    /// Read a byte range.
    ///
    /// `[start, end)` half-open; negative `start` selects the trailing
    /// `-start` bytes (suffix mode) and `end` is ignored.
    async fn read_range(&self, path: &Path, start: i64, end: i64) -> Result<Bytes>;

    /// Whether the object exists.
    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Object metadata.
    async fn stat(&self, path: &Path) -> Result<ObjectMeta>;

    /// One page of objects under `prefix`.
    async fn list(&self, prefix: &Path, token: Option<String>) -> Result<ListPage>;

    /// All objects under `prefix`, draining the pagination.
    async fn list_all(&self, prefix: &Path) -> Result<Vec<ObjectEntry>> {
        let mut out = vec![];
        let mut token = None;
        loop {
            let page = self.list(prefix, token).await?;
            out.extend(page.objects);
            token = page.next_token;
            if token.is_none() {
                return Ok(out);
            }
        }
    }

    /// Write (create or replace) the object.
    async fn write(&self, path: &Path, bytes: Bytes) -> Result<()>;

    /// Write such that readers never observe a partial object.
    async fn write_atomic(&self, path: &Path, bytes: Bytes) -> Result<()>;

    /// Conditional write.
    ///
    /// With `if_match: Some(etag)` the write succeeds only if the current
    /// object carries that ETag ([`ErrorKind::ETagMismatch`] otherwise).
    /// With `if_match: None` the write succeeds only if the object does
    /// not exist yet ([`ErrorKind::AlreadyExists`] otherwise). Returns the
    /// new ETag.
    async fn write_conditional(
        &self,
        path: &Path,
        bytes: Bytes,
        if_match: Option<&str>,
    ) -> Result<String>;

    /// Delete the object.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Delete every object under `prefix`, returning how many went away.
    async fn delete_prefix(&self, prefix: &Path) -> Result<usize>;

    /// Create a directory (and parents). A no-op for flat backends.
    async fn mkdir(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &Path) -> Result<()>;

    /// Backend name, e.g. `"memory"` or `"file"`.
    fn type_name(&self) -> &'static str;
}
