use crate::{ManifestConflictSnafu, Result, StoreSnafu};
use bytes::Bytes;
use data_types::Manifest;
use object_store::{ObjectStore, Path};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::debug;

/// Loads and CAS-updates per-namespace manifests.
///
/// Every write goes through the store's conditional-write primitive
/// against the ETag the manifest was read at; one transparent
/// re-read-and-retry absorbs a concurrent bump before the conflict
/// surfaces as [`crate::Error::ManifestConflict`].
#[derive(Debug)]
pub struct ManifestStore {
    store: Arc<dyn ObjectStore>,
}

impl ManifestStore {
    /// Create over `store`.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// SHA-256 of file contents, hex-encoded, for manifest entries.
    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Load the manifest at `path` along with its ETag; a missing file is
    /// an empty manifest with no ETag.
    pub async fn load(&self, path: &Path) -> Result<(Manifest, Option<String>)> {
        match self.store.read(path).await {
            Ok(raw) => {
                let manifest: Manifest =
                    serde_json::from_slice(&raw).map_err(|e| crate::Error::Validation {
                        reason: format!("manifest corrupt at {path}: {e}"),
                    })?;
                let etag = self.store.stat(path).await.context(StoreSnafu)?.etag;
                Ok((manifest, etag))
            }
            Err(e) if e.is_not_found() => Ok((Manifest::default(), None)),
            Err(e) => Err(e).context(StoreSnafu),
        }
    }

    /// Read-modify-write with ETag CAS.
    ///
    /// `mutate` receives the freshly loaded manifest and edits it in
    /// place; on an ETag race the load+mutate runs once more against the
    /// new state.
    pub async fn update<F>(&self, path: &Path, mutate: F) -> Result<Manifest>
    where
        F: Fn(&mut Manifest) + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let (mut manifest, etag) = self.load(path).await?;
            mutate(&mut manifest);
            let json = serde_json::to_vec(&manifest).expect("manifests serialize");

            let result = self
                .store
                .write_conditional(path, Bytes::from(json), etag.as_deref())
                .await;
            match result {
                Ok(_) => return Ok(manifest),
                Err(e) if e.is_conflict() && attempt == 0 => {
                    debug!(path = %path, "manifest CAS raced, retrying once");
                    attempt += 1;
                }
                Err(e) => return Err(e).context(ManifestConflictSnafu),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::ManifestFile;
    use object_store::InMemory;

    fn manifest_store() -> (Arc<dyn ObjectStore>, ManifestStore) {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        (Arc::clone(&store), ManifestStore::new(store))
    }

    fn path() -> Path {
        Path::parse("data/posts/manifest.json").unwrap()
    }

    #[tokio::test]
    async fn missing_manifest_is_empty() {
        let (_store, manifests) = manifest_store();
        let (manifest, etag) = manifests.load(&path()).await.unwrap();
        assert_eq!(manifest, Manifest::default());
        assert!(etag.is_none());
    }

    #[tokio::test]
    async fn update_creates_then_edits() {
        let (_store, manifests) = manifest_store();
        let p = path();

        manifests
            .update(&p, |m| {
                m.files.push(ManifestFile {
                    path: "data/posts/a.parquet".into(),
                    size_bytes: 10,
                    content_hash: ManifestStore::content_hash(b"aaa"),
                });
            })
            .await
            .unwrap();

        let updated = manifests
            .update(&p, |m| m.version_hint = Some(2))
            .await
            .unwrap();
        assert_eq!(updated.files.len(), 1);
        assert_eq!(updated.version_hint, Some(2));

        let (reloaded, etag) = manifests.load(&p).await.unwrap();
        assert_eq!(reloaded, updated);
        assert!(etag.is_some());
    }

    #[tokio::test]
    async fn updates_absorb_external_writes() {
        let (store, manifests) = manifest_store();
        let p = path();
        manifests.update(&p, |m| m.version_hint = Some(1)).await.unwrap();

        // another writer bumps the manifest; the next update reads the
        // fresh state (and ETag) and lands on top of it
        let (mut raced, _) = manifests.load(&p).await.unwrap();
        raced.version_hint = Some(7);
        store
            .write(&p, Bytes::from(serde_json::to_vec(&raced).unwrap()))
            .await
            .unwrap();

        let updated = manifests
            .update(&p, |m| {
                m.files.push(ManifestFile {
                    path: "data/posts/b.parquet".into(),
                    size_bytes: 5,
                    content_hash: "bb".into(),
                });
            })
            .await
            .unwrap();
        // the concurrent hint survives alongside our edit
        assert_eq!(updated.version_hint, Some(7));
        assert_eq!(updated.files.len(), 1);
    }
}
