use crate::{
    CorruptSnafu, DocLocation, Error, FamilyMismatchSnafu, IndexKey, IndexStats, Result,
    StoreSnafu,
};
use bytes::Bytes;
use object_store::{ObjectStore, Path};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use std::sync::Arc;

const FAMILY: &str = "hash";

#[derive(Debug, Serialize, Deserialize)]
struct Persisted {
    family: String,
    name: String,
    unique: bool,
    sparse: bool,
    entries: Vec<(IndexKey, Vec<DocLocation>)>,
}

/// Point-lookup secondary index backed by a hash map.
///
/// With `unique`, a second insert of an already-present key fails with
/// [`Error::UniqueConstraint`]; with `sparse` on top, all-null keys are
/// exempt from that constraint (multiple nulls allowed).
#[derive(Debug)]
pub struct HashIndex {
    name: String,
    unique: bool,
    sparse: bool,
    map: HashMap<IndexKey, Vec<DocLocation>>,
}

impl HashIndex {
    /// Create an empty index.
    pub fn new(name: impl Into<String>, unique: bool, sparse: bool) -> Self {
        Self {
            name: name.into(),
            unique,
            sparse,
            map: HashMap::new(),
        }
    }

    /// The index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn constrained(&self, key: &IndexKey) -> bool {
        self.unique && !(self.sparse && key.is_null_like())
    }

    /// Pre-flight uniqueness check: would inserting `key` (for a doc other
    /// than `exclude_doc_id`) violate the constraint?
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

    /// Ids of the documents stored under `key`.
    pub fn lookup(&self, key: &IndexKey) -> Vec<&DocLocation> {
        self.map
            .get(key)
            .map(|ls| ls.iter().collect())
            .unwrap_or_default()
    }

    /// Bulk build. Under `unique` the first duplicate fails the build and
    /// the index keeps its previous contents; no half-indexed state.
    pub fn build_from_array(&mut self, items: Vec<(IndexKey, DocLocation)>) -> Result<()> {
        let mut staged = Self::new(self.name.clone(), self.unique, self.sparse);
        for (key, location) in items {
            staged.insert(key, location)?;
        }
        self.map = staged.map;
        Ok(())
    }

    /// Persist to `path`.
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

    fn key(s: &str) -> IndexKey {
        IndexKey::single(Value::from(s))
    }

    fn loc(doc: &str) -> DocLocation {
        DocLocation::new(doc, 0, 0)
    }

    #[test]
    fn insert_lookup_remove() {
        let mut index = HashIndex::new("idx_email", false, false);
        index.insert(key("a"), loc("users/u1")).unwrap();
        index.insert(key("a"), loc("users/u2")).unwrap();

        let hits = index.lookup(&key("a"));
        assert_eq!(hits.len(), 2);
        assert!(index.lookup(&key("b")).is_empty());

        assert!(index.remove(&key("a"), "users/u1"));
        assert_eq!(index.lookup(&key("a")).len(), 1);
        assert!(!index.remove(&key("a"), "users/u1"));
    }

    #[test]
    fn unique_rejects_second_insert() {
        let mut index = HashIndex::new("idx_email", true, false);
        index.insert(key("a"), loc("users/u1")).unwrap();

        let err = index.insert(key("a"), loc("users/u2")).unwrap_err();
        assert_matches!(
            err,
            Error::UniqueConstraint { index_name, value }
                if index_name == "idx_email" && value.contains('a')
        );

        // re-inserting for the same doc is fine (update in place)
        index.insert(key("a"), loc("users/u1")).unwrap();
    }

    #[test]
    fn sparse_exempts_nulls_only() {
        let mut index = HashIndex::new("idx_phone", true, true);
        index.insert(IndexKey::single(Value::Null), loc("users/u1")).unwrap();
        index.insert(IndexKey::single(Value::Null), loc("users/u2")).unwrap();

        index.insert(key("555"), loc("users/u3")).unwrap();
        assert_matches!(
            index.insert(key("555"), loc("users/u4")),
            Err(Error::UniqueConstraint { .. })
        );
    }

    #[test]
    fn non_sparse_treats_null_as_a_value() {
        let mut index = HashIndex::new("idx", true, false);
        index.insert(IndexKey::single(Value::Null), loc("a/1")).unwrap();
        assert_matches!(
            index.insert(IndexKey::single(Value::Null), loc("a/2")),
            Err(Error::UniqueConstraint { .. })
        );
    }

    #[test]
    fn check_unique_pre_flight() {
        let mut index = HashIndex::new("idx", true, false);
        index.insert(key("a"), loc("users/u1")).unwrap();

        assert!(!index.check_unique(&key("a"), None));
        assert!(index.check_unique(&key("a"), Some("users/u1")));
        assert!(index.check_unique(&key("b"), None));
    }

    #[test]
    fn build_from_array_fails_atomically() {
        let mut index = HashIndex::new("idx_email", true, false);
        index.insert(key("existing"), loc("users/u0")).unwrap();

        let err = index
            .build_from_array(vec![
                (key("a"), loc("users/u1")),
                (key("b"), loc("users/u2")),
                (key("a"), loc("users/u3")),
            ])
            .unwrap_err();
        assert_matches!(err, Error::UniqueConstraint { .. });

        // previous contents intact, nothing half-indexed
        assert_eq!(index.lookup(&key("existing")).len(), 1);
        assert!(index.lookup(&key("a")).is_empty());
        assert!(index.lookup(&key("b")).is_empty());
    }

    #[test]
    fn composite_keys_are_tuple_wide() {
        let mut index = HashIndex::new("idx_name_dob", true, false);
        let k1 = IndexKey::composite(vec![Value::from("jane"), Value::Int(1990)]);
        let k2 = IndexKey::composite(vec![Value::from("jane"), Value::Int(1991)]);
        index.insert(k1.clone(), loc("users/u1")).unwrap();
        index.insert(k2, loc("users/u2")).unwrap();
        assert_matches!(
            index.insert(k1, loc("users/u3")),
            Err(Error::UniqueConstraint { .. })
        );
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let path = Path::parse("indexes/users/email.hash.json").unwrap();

        let mut index = HashIndex::new("idx_email", true, false);
        index.insert(key("a"), loc("users/u1")).unwrap();
        index.save(&store, &path).await.unwrap();

        let mut loaded = HashIndex::new("placeholder", false, false);
        loaded.load(&store, &path).await.unwrap();
        assert_eq!(loaded.name(), "idx_email");
        assert_eq!(loaded.lookup(&key("a")).len(), 1);
        // the unique flag came along
        assert_matches!(
            loaded.insert(key("a"), loc("users/u9")),
            Err(Error::UniqueConstraint { .. })
        );

        let stats = loaded.get_stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.entries, 1);
        assert!(stats.unique);
    }
}
