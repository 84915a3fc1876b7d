use crate::{
    Error, ErrorKind, ListPage, ObjectEntry, ObjectMeta, ObjectStore, Path, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use db_time::{SystemProvider, TimeProvider};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Default page size for [`InMemory::list`].
const LIST_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Clone)]
struct Blob {
    data: Bytes,
    mtime: i64,
    etag: u64,
}

/// A fully in-memory [`ObjectStore`], used by unit tests and as the
/// reference semantics for the other backends.
#[derive(Debug)]
pub struct InMemory {
    state: RwLock<State>,
    etag_counter: AtomicU64,
    time_provider: Arc<dyn TimeProvider>,
}

#[derive(Debug, Default)]
struct State {
    blobs: BTreeMap<String, Blob>,
    dirs: BTreeSet<String>,
}

impl Default for InMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemory {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_time_provider(Arc::new(SystemProvider::new()))
    }

    /// Create an empty store reading time from `time_provider`.
    pub fn with_time_provider(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            etag_counter: AtomicU64::new(1),
            time_provider,
        }
    }

    fn next_etag(&self) -> u64 {
        self.etag_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn now_ms(&self) -> i64 {
        self.time_provider.now().timestamp_millis()
    }

    fn not_found(path: &Path) -> Error {
        Error::new(ErrorKind::NotFound, Some(path.as_str().to_string()))
    }
}

fn slice_range(data: &Bytes, path: &Path, start: i64, end: i64) -> Result<Bytes> {
    let len = data.len() as i64;
    let (from, to) = if start < 0 {
        // suffix mode: last `-start` bytes
        ((len + start).max(0), len)
    } else {
        (start.min(len), end.clamp(start, len))
    };
    let _ = path;
    Ok(data.slice(from as usize..to as usize))
}

#[async_trait]
impl ObjectStore for InMemory {
    async fn read(&self, path: &Path) -> Result<Bytes> {
        let state = self.state.read();
        state
            .blobs
            .get(path.as_str())
            .map(|b| b.data.clone())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn read_range(&self, path: &Path, start: i64, end: i64) -> Result<Bytes> {
        let data = self.read(path).await?;
        slice_range(&data, path, start, end)
    }

    async fn stat(&self, path: &Path) -> Result<ObjectMeta> {
        let state = self.state.read();
        state
            .blobs
            .get(path.as_str())
            .map(|b| ObjectMeta {
                size: b.data.len() as u64,
                mtime: b.mtime,
                etag: Some(b.etag.to_string()),
            })
            .ok_or_else(|| Self::not_found(path))
    }

    async fn list(&self, prefix: &Path, token: Option<String>) -> Result<ListPage> {
        let state = self.state.read();
        let wanted = format!("{}/", prefix.as_str());

        let objects: Vec<ObjectEntry> = state
            .blobs
            .range(token.clone().unwrap_or_default()..)
            .filter(|(k, _)| token.as_deref() != Some(k.as_str()))
            .filter(|(k, _)| k.starts_with(&wanted) || *k == prefix.as_str())
            .take(LIST_PAGE_SIZE)
            .map(|(k, b)| ObjectEntry {
                path: Path::parse(k).expect("stored paths are valid"),
                size: b.data.len() as u64,
            })
            .collect();

        let next_token = (objects.len() == LIST_PAGE_SIZE)
            .then(|| objects.last().map(|o| o.path.as_str().to_string()))
            .flatten();

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn write(&self, path: &Path, bytes: Bytes) -> Result<()> {
        let blob = Blob {
            data: bytes,
            mtime: self.now_ms(),
            etag: self.next_etag(),
        };
        self.state
            .write()
            .blobs
            .insert(path.as_str().to_string(), blob);
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, bytes: Bytes) -> Result<()> {
        // a single map insert is already atomic for readers
        self.write(path, bytes).await
    }

    async fn write_conditional(
        &self,
        path: &Path,
        bytes: Bytes,
        if_match: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state.write();
        let current = state.blobs.get(path.as_str());

        match (if_match, current) {
            (None, Some(_)) => {
                return Err(Error::new(
                    ErrorKind::AlreadyExists,
                    Some(path.as_str().to_string()),
                ));
            }
            (Some(expected), current) => {
                let actual = current.map(|b| b.etag.to_string());
                if actual.as_deref() != Some(expected) {
                    return Err(Error::new(
                        ErrorKind::ETagMismatch,
                        Some(path.as_str().to_string()),
                    )
                    .with_context(format!(
                        "expected etag {expected:?}, found {actual:?}"
                    )));
                }
            }
            (None, None) => {}
        }

        let etag = self.next_etag();
        state.blobs.insert(
            path.as_str().to_string(),
            Blob {
                data: bytes,
                mtime: self.now_ms(),
                etag,
            },
        );
        Ok(etag.to_string())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.state
            .write()
            .blobs
            .remove(path.as_str())
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<usize> {
        let mut state = self.state.write();
        let wanted = format!("{}/", prefix.as_str());
        let keys: Vec<String> = state
            .blobs
            .keys()
            .filter(|k| k.starts_with(&wanted) || *k == prefix.as_str())
            .cloned()
            .collect();
        for k in &keys {
            state.blobs.remove(k);
        }
        Ok(keys.len())
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        self.state.write().dirs.insert(path.as_str().to_string());
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        let mut state = self.state.write();
        let wanted = format!("{}/", path.as_str());
        if state.blobs.keys().any(|k| k.starts_with(&wanted)) {
            return Err(Error::new(
                ErrorKind::DirectoryNotEmpty,
                Some(path.as_str().to_string()),
            ));
        }
        state.dirs.remove(path.as_str());
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let store = InMemory::new();
        let p = path("data/posts/a.parquet");

        store.write(&p, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(store.read(&p).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(store.exists(&p).await.unwrap());
        assert!(!store.exists(&path("data/other")).await.unwrap());

        let meta = store.stat(&p).await.unwrap();
        assert_eq!(meta.size, 5);
        assert!(meta.etag.is_some());
    }

    #[tokio::test]
    async fn range_reads() {
        let store = InMemory::new();
        let p = path("f");
        store
            .write(&p, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        // half-open interval
        assert_eq!(
            store.read_range(&p, 2, 5).await.unwrap(),
            Bytes::from_static(b"234")
        );
        // suffix mode
        assert_eq!(
            store.read_range(&p, -3, 0).await.unwrap(),
            Bytes::from_static(b"789")
        );
        // clamped past the end
        assert_eq!(
            store.read_range(&p, 8, 100).await.unwrap(),
            Bytes::from_static(b"89")
        );
    }

    #[tokio::test]
    async fn conditional_writes() {
        let store = InMemory::new();
        let p = path("manifest.json");

        // create-if-absent
        let etag1 = store
            .write_conditional(&p, Bytes::from_static(b"v1"), None)
            .await
            .unwrap();

        // second create collides
        let err = store
            .write_conditional(&p, Bytes::from_static(b"v1b"), None)
            .await
            .unwrap_err();
        assert_matches!(err.kind(), ErrorKind::AlreadyExists);

        // CAS with the right etag succeeds
        let etag2 = store
            .write_conditional(&p, Bytes::from_static(b"v2"), Some(&etag1))
            .await
            .unwrap();
        assert_ne!(etag1, etag2);

        // stale etag fails
        let err = store
            .write_conditional(&p, Bytes::from_static(b"v3"), Some(&etag1))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
        assert_eq!(store.read(&p).await.unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn listing_and_prefix_delete() {
        let store = InMemory::new();
        for name in ["data/a/1", "data/a/2", "data/b/1"] {
            store
                .write(&path(name), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let page = store.list(&path("data/a"), None).await.unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.next_token.is_none());

        let all = store.list_all(&path("data")).await.unwrap();
        assert_eq!(all.len(), 3);

        assert_eq!(store.delete_prefix(&path("data/a")).await.unwrap(), 2);
        assert_eq!(store.list_all(&path("data")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rmdir_refuses_non_empty() {
        let store = InMemory::new();
        store.mkdir(&path("d")).await.unwrap();
        store
            .write(&path("d/file"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let err = store.rmdir(&path("d")).await.unwrap_err();
        assert_matches!(err.kind(), ErrorKind::DirectoryNotEmpty);

        store.delete(&path("d/file")).await.unwrap();
        store.rmdir(&path("d")).await.unwrap();
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = InMemory::new();
        let err = store.delete(&path("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
