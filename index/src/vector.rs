//! Memory-bounded HNSW vector index.
//!
//! The graph nodes are write-back cached: hot nodes live deserialized in
//! an LRU bounded by `max_nodes` and `max_bytes`, cold nodes spill to the
//! object store and reload on demand. Eviction therefore never loses
//! data: `size` (nodes the index holds) is independent of `cached_size`
//! (nodes currently in RAM).

use crate::{
    CorruptSnafu, DimensionMismatchSnafu, FamilyMismatchSnafu, IndexStats, NodeLostSnafu, Result,
    StoreSnafu,
};
use bytes::Bytes;
use lru::LruCache;
use object_store::{ObjectStore, Path};
use rand::Rng;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

const FAMILY: &str = "vector";

/// Distance metric of the vector space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine distance (`1 - cosine similarity`).
    Cosine,
    /// Squared euclidean distance.
    L2,
    /// Negative inner product.
    Ip,
}

impl DistanceMetric {
    /// Distance between two equal-length vectors; smaller is closer.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (na * nb)
                }
            }
            Self::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Self::Ip => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        }
    }
}

/// HNSW construction and cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Vector dimensionality.
    pub dimensions: usize,
    /// Distance metric.
    pub metric: DistanceMetric,
    /// Max neighbors per node per layer (layer 0 allows `2 * m`).
    pub m: usize,
    /// Beam width during construction.
    pub ef_construction: usize,
    /// Beam width during search.
    pub ef_search: usize,
    /// Cache capacity in nodes.
    pub max_nodes: usize,
    /// Cache capacity in bytes (estimated).
    pub max_bytes: usize,
}

impl HnswConfig {
    /// Defaults for `dimensions`-dimensional cosine space.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            metric: DistanceMetric::Cosine,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            max_nodes: 10_000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    id: u64,
    vector: Vec<f32>,
    // neighbor ids, one list per layer (index 0 = layer 0)
    neighbors: Vec<Vec<u64>>,
}

impl Node {
    fn estimated_bytes(&self) -> usize {
        64 + self.vector.len() * 4 + self.neighbors.iter().map(|n| n.len() * 8).sum::<usize>()
    }

    fn top_layer(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    family: String,
    name: String,
    config: HnswConfig,
    entry_point: Option<u64>,
    next_id: u64,
    size: u64,
    doc_ids: HashMap<u64, String>,
}

/// Candidate ordered by distance for the max-heap result set.
#[derive(Debug, PartialEq)]
struct Candidate {
    distance: f32,
    id: u64,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Document the vector belongs to.
    pub doc_id: String,
    /// Distance to the query (metric-dependent, smaller is closer).
    pub distance: f32,
}

/// The HNSW index.
pub struct HnswIndex {
    name: String,
    config: HnswConfig,
    store: Arc<dyn ObjectStore>,
    prefix: Path,

    cache: LruCache<u64, Node>,
    cached_bytes: usize,
    dirty: HashSet<u64>,

    entry_point: Option<u64>,
    next_id: u64,
    size: u64,
    doc_ids: HashMap<u64, String>,

    on_evict: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("size", &self.size)
            .field("cached_size", &self.cache.len())
            .field("cached_bytes", &self.cached_bytes)
            .finish()
    }
}

impl HnswIndex {
    /// Create an empty index persisting nodes under `prefix`.
    pub fn new(
        name: impl Into<String>,
        config: HnswConfig,
        store: Arc<dyn ObjectStore>,
        prefix: Path,
    ) -> Self {
        let cap = NonZeroUsize::new(config.max_nodes.max(1)).expect("non-zero");
        Self {
            name: name.into(),
            config,
            store,
            prefix,
            cache: LruCache::new(cap),
            cached_bytes: 0,
            dirty: HashSet::new(),
            entry_point: None,
            next_id: 0,
            size: 0,
            doc_ids: HashMap::new(),
            on_evict: None,
        }
    }

    /// Register an eviction observer.
    pub fn set_on_evict(&mut self, observer: Arc<dyn Fn(u64) + Send + Sync>) {
        self.on_evict = Some(observer);
    }

    /// Total nodes the index holds (independent of what is cached).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Nodes currently resident in RAM.
    pub fn cached_size(&self) -> usize {
        self.cache.len()
    }

    /// Estimated bytes of the resident nodes.
    pub fn memory_usage(&self) -> usize {
        self.cached_bytes
    }

    fn node_path(&self, id: u64) -> Path {
        self.prefix
            .join(&format!("nodes/{id}.json"))
            .expect("node paths are valid")
    }

    fn meta_path(&self) -> Path {
        self.prefix.join("meta.json").expect("meta path is valid")
    }

    /// Insert a node into the cache, evicting cold ones past the limits.
    async fn admit(&mut self, node: Node) -> Result<()> {
        let id = node.id;
        self.cached_bytes += node.estimated_bytes();
        if let Some((old_id, old)) = self.cache.push(id, node) {
            if old_id == id {
                // replaced in place
                self.cached_bytes -= old.estimated_bytes();
            } else {
                self.spill(old_id, old).await?;
            }
        }
        while self.cache.len() > self.config.max_nodes
            || self.cached_bytes > self.config.max_bytes
        {
            match self.cache.pop_lru() {
                Some((old_id, old)) => self.spill(old_id, old).await?,
                None => break,
            }
        }
        Ok(())
    }

    /// Write an evicted node out if it carries unsaved changes.
    async fn spill(&mut self, id: u64, node: Node) -> Result<()> {
        self.cached_bytes -= node.estimated_bytes();
        if self.dirty.remove(&id) {
            let json = serde_json::to_vec(&node).expect("nodes serialize");
            self.store
                .write_atomic(&self.node_path(id), Bytes::from(json))
                .await
                .context(StoreSnafu)?;
        }
        if let Some(observer) = &self.on_evict {
            observer(id);
        }
        Ok(())
    }

    async fn fetch(&mut self, id: u64) -> Result<Node> {
        if let Some(node) = self.cache.get(&id) {
            return Ok(node.clone());
        }
        let raw = self
            .store
            .read(&self.node_path(id))
            .await
            .map_err(|_| NodeLostSnafu { node_id: id }.build())?;
        let node: Node = serde_json::from_slice(&raw).context(CorruptSnafu)?;
        let clone = node.clone();
        self.admit(node).await?;
        Ok(clone)
    }

    async fn put(&mut self, node: Node) -> Result<()> {
        self.dirty.insert(node.id);
        if let Some(existing) = self.cache.peek(&node.id) {
            self.cached_bytes -= existing.estimated_bytes();
            self.cached_bytes += node.estimated_bytes();
            self.cache.put(node.id, node);
            Ok(())
        } else {
            self.admit(node).await
        }
    }

    fn random_level(&self) -> usize {
        let ml = 1.0 / (self.config.m as f64).ln();
        let uniform: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
        (-uniform.ln() * ml).floor() as usize
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.config.metric.distance(a, b)
    }

    /// Greedy beam search on one layer.
    async fn search_layer(
        &mut self,
        query: &[f32],
        entry: u64,
        layer: usize,
        ef: usize,
    ) -> Result<Vec<Candidate>> {
        let entry_node = self.fetch(entry).await?;
        let entry_distance = self.distance(query, &entry_node.vector);

        let mut visited: HashSet<u64> = HashSet::from([entry]);
        // min-heap of candidates via Reverse, max-heap of results
        let mut candidates = BinaryHeap::from([std::cmp::Reverse(Candidate {
            distance: entry_distance,
            id: entry,
        })]);
        let mut results = BinaryHeap::from([Candidate {
            distance: entry_distance,
            id: entry,
        }]);

        while let Some(std::cmp::Reverse(closest)) = candidates.pop() {
            let worst = results.peek().expect("results non-empty").distance;
            if closest.distance > worst && results.len() >= ef {
                break;
            }
            let node = self.fetch(closest.id).await?;
            let neighbors = node
                .neighbors
                .get(layer)
                .cloned()
                .unwrap_or_default();
            for neighbor_id in neighbors {
                if !visited.insert(neighbor_id) {
                    continue;
                }
                let neighbor = self.fetch(neighbor_id).await?;
                let d = self.distance(query, &neighbor.vector);
                let worst = results.peek().expect("results non-empty").distance;
                if results.len() < ef || d < worst {
                    candidates.push(std::cmp::Reverse(Candidate {
                        distance: d,
                        id: neighbor_id,
                    }));
                    results.push(Candidate {
                        distance: d,
                        id: neighbor_id,
                    });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut sorted = results.into_vec();
        sorted.sort();
        Ok(sorted)
    }

    /// Insert a vector for `doc_id`.
    pub async fn insert(&mut self, vector: Vec<f32>, doc_id: &str) -> Result<()> {
        ensure!(
            vector.len() == self.config.dimensions,
            DimensionMismatchSnafu {
                got: vector.len(),
                expected: self.config.dimensions,
            }
        );

        let id = self.next_id;
        self.next_id += 1;
        let level = self.random_level();
        let mut node = Node {
            id,
            vector,
            neighbors: vec![vec![]; level + 1],
        };

        match self.entry_point {
            None => {
                self.put(node).await?;
                self.entry_point = Some(id);
            }
            Some(entry) => {
                let entry_node = self.fetch(entry).await?;
                let top = entry_node.top_layer();
                let mut current = entry;

                // greedy descent through the layers above the new node
                for layer in ((level + 1)..=top).rev() {
                    let found = self
                        .search_layer(&node.vector, current, layer, 1)
                        .await?;
                    if let Some(best) = found.first() {
                        current = best.id;
                    }
                }

                // connect on each shared layer
                for layer in (0..=level.min(top)).rev() {
                    let found = self
                        .search_layer(&node.vector, current, layer, self.config.ef_construction)
                        .await?;
                    if let Some(best) = found.first() {
                        current = best.id;
                    }
                    let m_max = if layer == 0 {
                        self.config.m * 2
                    } else {
                        self.config.m
                    };
                    let chosen: Vec<u64> =
                        found.iter().take(self.config.m).map(|c| c.id).collect();
                    node.neighbors[layer] = chosen.clone();

                    for neighbor_id in chosen {
                        let mut neighbor = self.fetch(neighbor_id).await?;
                        if neighbor.neighbors.len() <= layer {
                            neighbor.neighbors.resize(layer + 1, vec![]);
                        }
                        neighbor.neighbors[layer].push(id);
                        if neighbor.neighbors[layer].len() > m_max {
                            self.prune_neighbors(&mut neighbor, layer, m_max).await?;
                        }
                        self.put(neighbor).await?;
                    }
                }

                let new_top = node.top_layer();
                self.put(node).await?;
                if new_top > top {
                    self.entry_point = Some(id);
                }
            }
        }

        self.size += 1;
        self.doc_ids.insert(id, doc_id.to_string());
        Ok(())
    }

    /// Keep only the `m_max` closest neighbors of `node` on `layer`.
    async fn prune_neighbors(&mut self, node: &mut Node, layer: usize, m_max: usize) -> Result<()> {
        let mut scored = vec![];
        for neighbor_id in &node.neighbors[layer] {
            let neighbor = self.fetch(*neighbor_id).await?;
            scored.push(Candidate {
                distance: self.distance(&node.vector, &neighbor.vector),
                id: *neighbor_id,
            });
        }
        scored.sort();
        node.neighbors[layer] = scored.into_iter().take(m_max).map(|c| c.id).collect();
        Ok(())
    }

    /// `k` nearest neighbors of `query`.
    pub async fn search(&mut self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        ensure!(
            query.len() == self.config.dimensions,
            DimensionMismatchSnafu {
                got: query.len(),
                expected: self.config.dimensions,
            }
        );
        let Some(entry) = self.entry_point else {
            return Ok(vec![]);
        };

        let entry_node = self.fetch(entry).await?;
        let mut current = entry;
        for layer in (1..=entry_node.top_layer()).rev() {
            let found = self.search_layer(query, current, layer, 1).await?;
            if let Some(best) = found.first() {
                current = best.id;
            }
        }

        let ef = self.config.ef_search.max(k);
        let found = self.search_layer(query, current, 0, ef).await?;
        Ok(found
            .into_iter()
            .filter_map(|c| {
                self.doc_ids.get(&c.id).map(|doc_id| VectorHit {
                    doc_id: doc_id.clone(),
                    distance: c.distance,
                })
            })
            .take(k)
            .collect())
    }

    /// Remove the vector of `doc_id`. Returns whether anything was
    /// removed.
    pub async fn remove(&mut self, doc_id: &str) -> Result<bool> {
        let Some((&id, _)) = self.doc_ids.iter().find(|(_, d)| d.as_str() == doc_id) else {
            return Ok(false);
        };
        self.doc_ids.remove(&id);

        let node = self.fetch(id).await?;
        // detach from every neighbor that points back
        let all_neighbors: HashSet<u64> = node.neighbors.iter().flatten().copied().collect();
        for neighbor_id in all_neighbors {
            if let Ok(mut neighbor) = self.fetch(neighbor_id).await {
                for list in &mut neighbor.neighbors {
                    list.retain(|n| *n != id);
                }
                self.put(neighbor).await?;
            }
        }

        if let Some(node) = self.cache.pop(&id) {
            self.cached_bytes -= node.estimated_bytes();
        }
        self.dirty.remove(&id);
        match self.store.delete(&self.node_path(id)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(StoreSnafu),
        }
        self.size -= 1;

        if self.entry_point == Some(id) {
            // fall back to any remaining node
            self.entry_point = self.doc_ids.keys().next().copied();
        }
        debug!(doc_id, node = id, "removed vector");
        Ok(true)
    }

    /// Bulk build from `(vector, doc_id)` pairs.
    pub async fn build_from_array(&mut self, items: Vec<(Vec<f32>, String)>) -> Result<()> {
        for (vector, doc_id) in items {
            self.insert(vector, &doc_id).await?;
        }
        Ok(())
    }

    /// Persist all dirty nodes and the index metadata.
    pub async fn save(&mut self) -> Result<()> {
        let dirty: Vec<u64> = self.dirty.iter().copied().collect();
        for id in dirty {
            if let Some(node) = self.cache.peek(&id) {
                let json = serde_json::to_vec(node).expect("nodes serialize");
                self.store
                    .write_atomic(&self.node_path(id), Bytes::from(json))
                    .await
                    .context(StoreSnafu)?;
            }
            self.dirty.remove(&id);
        }

        let meta = Meta {
            family: FAMILY.to_string(),
            name: self.name.clone(),
            config: self.config.clone(),
            entry_point: self.entry_point,
            next_id: self.next_id,
            size: self.size,
            doc_ids: self.doc_ids.clone(),
        };
        let json = serde_json::to_vec(&meta).expect("meta serializes");
        self.store
            .write_atomic(&self.meta_path(), Bytes::from(json))
            .await
            .context(StoreSnafu)
    }

    /// Load the index metadata; nodes reload lazily on access.
    pub async fn load(&mut self) -> Result<()> {
        let raw = self
            .store
            .read(&self.meta_path())
            .await
            .context(StoreSnafu)?;
        let meta: Meta = serde_json::from_slice(&raw).context(CorruptSnafu)?;
        ensure!(
            meta.family == FAMILY,
            FamilyMismatchSnafu {
                expected: FAMILY,
                found: meta.family,
            }
        );
        self.name = meta.name;
        self.config = meta.config;
        self.entry_point = meta.entry_point;
        self.next_id = meta.next_id;
        self.size = meta.size;
        self.doc_ids = meta.doc_ids;
        self.cache.clear();
        self.cached_bytes = 0;
        self.dirty.clear();
        Ok(())
    }

    /// Counters.
    pub fn get_stats(&self) -> IndexStats {
        IndexStats {
            name: self.name.clone(),
            family: FAMILY.to_string(),
            keys: self.size,
            entries: self.size,
            unique: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::InMemory;
    use parking_lot::Mutex;

    fn config(dims: usize) -> HnswConfig {
        HnswConfig {
            ef_construction: 32,
            ef_search: 32,
            ..HnswConfig::new(dims)
        }
    }

    fn index_with(config: HnswConfig) -> HnswIndex {
        HnswIndex::new(
            "idx_vec",
            config,
            Arc::new(InMemory::new()),
            Path::parse("indexes/posts/vec").unwrap(),
        )
    }

    fn basis(dims: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis] = 1.0;
        v
    }

    #[tokio::test]
    async fn nearest_neighbor_search() {
        let mut index = index_with(config(4));
        for axis in 0..4 {
            index
                .insert(basis(4, axis), &format!("docs/d{axis}"))
                .await
                .unwrap();
        }

        let hits = index.search(&[0.9, 0.1, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "docs/d0");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let mut index = index_with(config(4));
        let err = index.insert(vec![1.0, 2.0], "docs/d0").await.unwrap_err();
        assert!(matches!(err, crate::Error::DimensionMismatch { got: 2, expected: 4 }));
        let err = index.search(&[1.0], 1).await.unwrap_err();
        assert!(matches!(err, crate::Error::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn metrics_order_differently() {
        let a = vec![1.0, 0.0];
        let b = vec![2.0, 0.0];
        assert!(DistanceMetric::Cosine.distance(&a, &b) < 1e-6);
        assert!((DistanceMetric::L2.distance(&a, &b) - 1.0).abs() < 1e-6);
        // larger inner product = closer = smaller (more negative) distance
        assert!(DistanceMetric::Ip.distance(&a, &b) < DistanceMetric::Ip.distance(&a, &a));
    }

    #[tokio::test]
    async fn eviction_bounds_cache_but_not_size() {
        let mut cfg = config(8);
        cfg.max_nodes = 4;
        let mut index = index_with(cfg);

        let evicted = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&evicted);
        index.set_on_evict(Arc::new(move |id| captured.lock().push(id)));

        for i in 0..16 {
            let mut v = vec![0.0f32; 8];
            v[i % 8] = 1.0 + (i as f32) * 0.01;
            index.insert(v, &format!("docs/d{i}")).await.unwrap();
        }

        assert_eq!(index.size(), 16);
        assert!(index.cached_size() <= 4);
        assert!(!evicted.lock().is_empty());

        // evicted nodes are still searchable (reloaded from the store)
        let hits = index.search(&basis(8, 3), 4).await.unwrap();
        assert_eq!(hits.len(), 4);
    }

    #[tokio::test]
    async fn byte_budget_also_evicts() {
        let mut cfg = config(8);
        cfg.max_bytes = 400;
        let mut index = index_with(cfg);
        for i in 0..8 {
            index.insert(basis(8, i % 8), &format!("docs/d{i}")).await.unwrap();
        }
        assert!(index.memory_usage() <= 400 + 200, "{}", index.memory_usage());
        assert_eq!(index.size(), 8);
    }

    #[tokio::test]
    async fn remove_detaches_and_shrinks() {
        let mut index = index_with(config(4));
        for axis in 0..4 {
            index.insert(basis(4, axis), &format!("docs/d{axis}")).await.unwrap();
        }
        assert!(index.remove("docs/d1").await.unwrap());
        assert!(!index.remove("docs/d1").await.unwrap());
        assert_eq!(index.size(), 3);

        let hits = index.search(&basis(4, 1), 4).await.unwrap();
        assert!(hits.iter().all(|h| h.doc_id != "docs/d1"));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let prefix = Path::parse("indexes/posts/vec").unwrap();

        let mut index = HnswIndex::new("idx_vec", config(4), Arc::clone(&store), prefix.clone());
        for axis in 0..4 {
            index.insert(basis(4, axis), &format!("docs/d{axis}")).await.unwrap();
        }
        index.save().await.unwrap();

        let mut loaded = HnswIndex::new("x", config(4), store, prefix);
        loaded.load().await.unwrap();
        assert_eq!(loaded.size(), 4);
        assert_eq!(loaded.cached_size(), 0);

        let hits = loaded.search(&basis(4, 2), 1).await.unwrap();
        assert_eq!(hits[0].doc_id, "docs/d2");
    }
}
