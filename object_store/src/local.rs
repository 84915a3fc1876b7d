use crate::{
    Error, ErrorKind, ListPage, ObjectEntry, ObjectMeta, ObjectStore, Path, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;
use walkdir::WalkDir;

const LIST_PAGE_SIZE: usize = 1_000;

/// ENOTEMPTY / ENOSPC are matched by raw OS code; the typed
/// `io::ErrorKind` variants for them are newer than our MSRV.
const ENOTEMPTY: i32 = 39;
const ENOSPC: i32 = 28;

/// [`ObjectStore`] over a local directory tree.
///
/// `write_atomic` goes through a same-directory temp file plus rename so a
/// crash never leaves a partial object under its final name.
#[derive(Debug)]
pub struct LocalFileSystem {
    root: PathBuf,
    // serializes conditional writes within this process; cross-process
    // callers coordinate through a remote store's real CAS
    cas_lock: tokio::sync::Mutex<()>,
}

impl LocalFileSystem {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| io_error(e, &root.display().to_string()))?;
        Ok(Self {
            root,
            cas_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path.as_str())
    }

    async fn stat_etag(&self, path: &Path) -> Result<Option<ObjectMeta>> {
        match self.stat(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn walk(&self, prefix: &Path) -> Result<Vec<ObjectEntry>> {
        let base = self.full(prefix);
        if !base.exists() {
            return Ok(vec![]);
        }
        let mut out = vec![];
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry =
                entry.map_err(|e| {
                    Error::new(ErrorKind::Unknown, Some(prefix.as_str().to_string()))
                        .with_source(e)
                })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .expect("entries live under the root");
            let rel = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
            out.push(ObjectEntry {
                path: Path::parse(&rel).map_err(|e| e.with_context("listing".into()))?,
                size: entry.metadata().map(|m| m.len()).unwrap_or(0),
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

fn io_error(e: std::io::Error, path: &str) -> Error {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        _ => match e.raw_os_error() {
            Some(ENOTEMPTY) => ErrorKind::DirectoryNotEmpty,
            Some(ENOSPC) => ErrorKind::Quota,
            _ => ErrorKind::Unknown,
        },
    };
    Error::new(kind, Some(path.to_string())).with_source(e)
}

fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl ObjectStore for LocalFileSystem {
    async fn read(&self, path: &Path) -> Result<Bytes> {
        let data = tokio::fs::read(self.full(path))
            .await
            .map_err(|e| io_error(e, path.as_str()))?;
        Ok(Bytes::from(data))
    }

    async fn read_range(&self, path: &Path, start: i64, end: i64) -> Result<Bytes> {
        let mut file = tokio::fs::File::open(self.full(path))
            .await
            .map_err(|e| io_error(e, path.as_str()))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| io_error(e, path.as_str()))?
            .len() as i64;

        let (from, to) = if start < 0 {
            ((len + start).max(0), len)
        } else {
            (start.min(len), end.clamp(start, len))
        };

        file.seek(SeekFrom::Start(from as u64))
            .await
            .map_err(|e| io_error(e, path.as_str()))?;
        let mut buf = vec![0u8; (to - from) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| io_error(e, path.as_str()))?;
        Ok(Bytes::from(buf))
    }

    async fn stat(&self, path: &Path) -> Result<ObjectMeta> {
        let meta = tokio::fs::metadata(self.full(path))
            .await
            .map_err(|e| io_error(e, path.as_str()))?;
        if meta.is_dir() {
            return Err(Error::new(
                ErrorKind::NotFound,
                Some(path.as_str().to_string()),
            )
            .with_context("is a directory".into()));
        }
        let mtime = mtime_ms(&meta);
        Ok(ObjectMeta {
            size: meta.len(),
            mtime,
            etag: Some(format!("{:x}-{:x}", mtime, meta.len())),
        })
    }

    async fn list(&self, prefix: &Path, token: Option<String>) -> Result<ListPage> {
        let all = self.walk(prefix)?;
        let objects: Vec<ObjectEntry> = all
            .into_iter()
            .filter(|o| match &token {
                Some(t) => o.path.as_str() > t.as_str(),
                None => true,
            })
            .take(LIST_PAGE_SIZE)
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
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, path.as_str()))?;
        }
        tokio::fs::write(&full, &bytes)
            .await
            .map_err(|e| io_error(e, path.as_str()))
    }

    async fn write_atomic(&self, path: &Path, bytes: Bytes) -> Result<()> {
        let full = self.full(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, path.as_str()))?;
        }
        let tmp = full.with_file_name(format!(
            ".{}.{}.tmp",
            full.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(e, path.as_str()))?;
        tokio::fs::rename(&tmp, &full)
            .await
            .map_err(|e| io_error(e, path.as_str()))
    }

    async fn write_conditional(
        &self,
        path: &Path,
        bytes: Bytes,
        if_match: Option<&str>,
    ) -> Result<String> {
        let _guard = self.cas_lock.lock().await;

        let current = self.stat_etag(path).await?;
        match (if_match, &current) {
            (None, Some(_)) => {
                return Err(Error::new(
                    ErrorKind::AlreadyExists,
                    Some(path.as_str().to_string()),
                ));
            }
            (Some(expected), current) => {
                let actual = current.as_ref().and_then(|m| m.etag.clone());
                if actual.as_deref() != Some(expected) {
                    return Err(Error::new(
                        ErrorKind::ETagMismatch,
                        Some(path.as_str().to_string()),
                    )
                    .with_context(format!("expected etag {expected:?}, found {actual:?}")));
                }
            }
            (None, None) => {}
        }

        self.write_atomic(path, bytes).await?;
        let meta = self.stat(path).await?;
        Ok(meta.etag.expect("local etags always derived"))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(self.full(path))
            .await
            .map_err(|e| io_error(e, path.as_str()))
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<usize> {
        let entries = self.walk(prefix)?;
        let n = entries.len();
        for entry in entries {
            self.delete(&entry.path).await?;
        }
        // drop now-empty directories, best effort
        let _ = tokio::fs::remove_dir_all(self.full(prefix)).await;
        Ok(n)
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(self.full(path))
            .await
            .map_err(|e| io_error(e, path.as_str()))
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_dir(self.full(path))
            .await
            .map_err(|e| io_error(e, path.as_str()))
    }

    fn type_name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn store() -> (tempfile::TempDir, LocalFileSystem) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileSystem::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn round_trip_and_ranges() {
        let (_dir, store) = store();
        let p = path("data/posts/a.parquet");

        store
            .write_atomic(&p, Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(
            store.read(&p).await.unwrap(),
            Bytes::from_static(b"0123456789")
        );
        assert_eq!(
            store.read_range(&p, 2, 5).await.unwrap(),
            Bytes::from_static(b"234")
        );
        assert_eq!(
            store.read_range(&p, -4, 0).await.unwrap(),
            Bytes::from_static(b"6789")
        );
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let (dir, store) = store();
        let p = path("x/y");
        store.write_atomic(&p, Bytes::from_static(b"v")).await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("x"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn conditional_write_cas() {
        let (_dir, store) = store();
        let p = path("manifest.json");

        let etag1 = store
            .write_conditional(&p, Bytes::from_static(b"v1"), None)
            .await
            .unwrap();

        let err = store
            .write_conditional(&p, Bytes::from_static(b"v1b"), None)
            .await
            .unwrap_err();
        assert_matches!(err.kind(), ErrorKind::AlreadyExists);

        store
            .write_conditional(&p, Bytes::from_static(b"longer v2"), Some(&etag1))
            .await
            .unwrap();

        let err = store
            .write_conditional(&p, Bytes::from_static(b"v3"), Some(&etag1))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn listing_and_prefix_delete() {
        let (_dir, store) = store();
        for name in ["data/a/1", "data/a/2", "data/b/1"] {
            store.write(&path(name), Bytes::from_static(b"x")).await.unwrap();
        }

        let all = store.list_all(&path("data")).await.unwrap();
        assert_eq!(all.len(), 3);

        assert_eq!(store.delete_prefix(&path("data/a")).await.unwrap(), 2);
        let rest = store.list_all(&path("data")).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].path.as_str(), "data/b/1");
    }

    #[tokio::test]
    async fn rmdir_semantics() {
        let (_dir, store) = store();
        store.mkdir(&path("d")).await.unwrap();
        store.write(&path("d/f"), Bytes::from_static(b"x")).await.unwrap();

        let err = store.rmdir(&path("d")).await.unwrap_err();
        assert_matches!(err.kind(), ErrorKind::DirectoryNotEmpty);

        store.delete(&path("d/f")).await.unwrap();
        store.rmdir(&path("d")).await.unwrap();
        assert!(!store.exists(&path("d/f")).await.unwrap());
    }
}
