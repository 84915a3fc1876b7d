use crate::{
    CorruptSnafu, DocLocation, FamilyMismatchSnafu, IndexKey, IndexStats, Result, StoreSnafu,
};
use bytes::Bytes;
use object_store::{ObjectStore, Path};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

const FAMILY: &str = "sst";

#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    family: String,
    name: String,
    unique: bool,
    sparse: bool,
    entries: Vec<(IndexKey, Vec<DocLocation>)>,
}

/// Sorted secondary index: point lookups plus range scans.
///
/// Same uniqueness/sparseness semantics as [`crate::HashIndex`]; the
/// sorted backing map adds `lookup_range`.
#[derive(Debug)]
pub struct SstIndex {
    name: String,
    unique: bool,
    sparse: bool,
    map: BTreeMap<IndexKey, Vec<DocLocation>>,
}

impl SstIndex {
    /// Create an empty index.
    pub fn new(name: impl Into<String>, unique: bool, sparse: bool) -> Self {
        Self {
            name: name.into(),
            unique,
            sparse,
            map: BTreeMap::new(),
        }
    }

    /// The index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn constrained(&self, key: &IndexKey) -> bool {
        self.unique && !(self.sparse && key.is_null_like())
    }

    /// Pre-flight uniqueness check.
    pub fn check_unique(&self, key: &IndexKey, exclude_doc_id: Option<&str>) -> bool {
        if !self.constrained(key) {
            return true;
        }
        match self.map.get(key) {
            None => true,
            Some(locations) => locations
                .iter()
                .all(|l| Some(l.doc_id.as_str()) == exclude_doc_id),
        }
    }

    /// Insert an entry.
    pub fn insert(&mut self, key: IndexKey, location: DocLocation) -> Result<()> {
        if self.constrained(&key) {
            ensure!(
                self.check_unique(&key, Some(&location.doc_id)),
                crate::UniqueConstraintSnafu {
                    index_name: self.name.clone(),
                    value: key.encode(),
                }
            );
        }
        self.map.entry(key).or_default().push(location);
        Ok(())
    }

    /// Remove the entry of `doc_id` under `key`.
    pub fn remove(&mut self, key: &IndexKey, doc_id: &str) -> bool {
        let Some(locations) = self.map.get_mut(key) else {
            return false;
        };
        let before = locations.len();
        locations.retain(|l| l.doc_id != doc_id);
        let removed = locations.len() < before;
        if locations.is_empty() {
            self.map.remove(key);
        }
        removed
    }

    /// Point lookup.
    pub fn lookup(&self, key: &IndexKey) -> Vec<&DocLocation> {
        self.map
            .get(key)
            .map(|ls| ls.iter().collect())
            .unwrap_or_default()
    }

    /// Range scan over `[min, max]`; either bound may be open.
    pub fn lookup_range(
        &self,
        min: Option<&IndexKey>,
        max: Option<&IndexKey>,
    ) -> Vec<&DocLocation> {
        let lower = min.map(|k| Bound::Included(k)).unwrap_or(Bound::Unbounded);
        let upper = max.map(|k| Bound::Included(k)).unwrap_or(Bound::Unbounded);
        self.map
            .range::<IndexKey, _>((lower, upper))
            .flat_map(|(_, ls)| ls.iter())
            .collect()
    }

    /// Bulk build with the same all-or-nothing guarantee as the hash
    /// index.
    pub fn build_from_array(&mut self, items: Vec<(IndexKey, DocLocation)>) -> Result<()> {
        let mut staged = Self::new(self.name.clone(), self.unique, self.sparse);
        for (key, location) in items {
            staged.insert(key, location)?;
        }
        self.map = staged.map;
        Ok(())
    }

    /// Persist to `path`, entries in key order.
    pub async fn save(&self, store: &Arc<dyn ObjectStore>, path: &Path) -> Result<()> {
        let persisted = Persisted {
            family: FAMILY.to_string(),
            name: self.name.clone(),
            unique: self.unique,
            sparse: self.sparse,
            entries: self
                .map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let json = serde_json::to_vec(&persisted).expect("index serializes");
        store
            .write_atomic(path, Bytes::from(json))
            .await
            .context(StoreSnafu)
    }

    /// Load from `path`, replacing the current contents.
    pub async fn load(&mut self, store: &Arc<dyn ObjectStore>, path: &Path) -> Result<()> {
        let raw = store.read(path).await.context(StoreSnafu)?;
        let persisted: Persisted = serde_json::from_slice(&raw).context(CorruptSnafu)?;
        ensure!(
            persisted.family == FAMILY,
            FamilyMismatchSnafu {
                expected: FAMILY,
                found: persisted.family,
            }
        );
        self.name = persisted.name;
        self.unique = persisted.unique;
        self.sparse = persisted.sparse;
        self.map = persisted.entries.into_iter().collect();
        Ok(())
    }

    /// Counters.
    pub fn get_stats(&self) -> IndexStats {
        IndexStats {
            name: self.name.clone(),
            family: FAMILY.to_string(),
            keys: self.map.len() as u64,
            entries: self.map.values().map(|v| v.len() as u64).sum(),
            unique: self.unique,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::Value;
    use object_store::InMemory;

    fn key(i: i64) -> IndexKey {
        IndexKey::single(Value::Int(i))
    }

    fn loc(doc: &str) -> DocLocation {
        DocLocation::new(doc, 0, 0)
    }

    fn ages() -> SstIndex {
        let mut index = SstIndex::new("idx_age", false, false);
        for (age, doc) in [(18, "u/a"), (25, "u/b"), (41, "u/c"), (64, "u/d")] {
            index.insert(key(age), loc(doc)).unwrap();
        }
        index
    }

    #[test]
    fn point_and_range_lookup() {
        let index = ages();
        assert_eq!(index.lookup(&key(25)).len(), 1);
        assert!(index.lookup(&key(26)).is_empty());

        let range: Vec<_> = index
            .lookup_range(Some(&key(18)), Some(&key(41)))
            .iter()
            .map(|l| l.doc_id.clone())
            .collect();
        assert_eq!(range, ["u/a", "u/b", "u/c"]);

        // open bounds
        assert_eq!(index.lookup_range(None, Some(&key(24))).len(), 1);
        assert_eq!(index.lookup_range(Some(&key(42)), None).len(), 1);
        assert_eq!(index.lookup_range(None, None).len(), 4);
    }

    #[test]
    fn unique_and_sparse_match_hash_semantics() {
        let mut index = SstIndex::new("idx", true, true);
        index.insert(IndexKey::single(Value::Null), loc("a/1")).unwrap();
        index.insert(IndexKey::single(Value::Null), loc("a/2")).unwrap();
        index.insert(key(7), loc("a/3")).unwrap();
        assert_matches!(
            index.insert(key(7), loc("a/4")),
            Err(crate::Error::UniqueConstraint { .. })
        );
    }

    #[test]
    fn build_from_array_is_atomic() {
        let mut index = SstIndex::new("idx", true, false);
        let err = index
            .build_from_array(vec![
                (key(1), loc("a/1")),
                (key(1), loc("a/2")),
            ])
            .unwrap_err();
        assert_matches!(err, crate::Error::UniqueConstraint { .. });
        assert!(index.lookup(&key(1)).is_empty());
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let path = Path::parse("indexes/users/age.sst.json").unwrap();

        let index = ages();
        index.save(&store, &path).await.unwrap();

        let mut loaded = SstIndex::new("placeholder", false, false);
        loaded.load(&store, &path).await.unwrap();
        assert_eq!(loaded.name(), "idx_age");
        assert_eq!(
            loaded.lookup_range(Some(&key(18)), Some(&key(41))).len(),
            3
        );
    }

    #[tokio::test]
    async fn hash_file_does_not_load_as_sst() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let path = Path::parse("indexes/users/email.hash.json").unwrap();

        let mut hash = crate::HashIndex::new("idx_email", false, false);
        hash.insert(IndexKey::single(Value::from("a")), loc("u/1"))
            .unwrap();
        hash.save(&store, &path).await.unwrap();

        let mut sst = SstIndex::new("x", false, false);
        let err = sst.load(&store, &path).await.unwrap_err();
        assert_matches!(err, crate::Error::FamilyMismatch { .. });
    }
}
