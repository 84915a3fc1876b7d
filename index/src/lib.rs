//! The index subsystem: hash and SST secondary indexes, a full-text index
//! with BM25 scoring, and a memory-bounded HNSW vector index with optional
//! product quantization.
//!
//! All families share one shape: insert/remove/lookup, a bulk
//! `build_from_array`, persistence through the object store, and a stats
//! surface. Unique constraints are enforced at insert time and violations
//! carry the index name and the offending value.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod fts;
mod hash;
mod key;
mod porter;
pub mod pq;
mod sst;
pub mod vector;

pub use fts::{FtsConfig, FtsIndex, HighlightOptions, SearchResult};
pub use hash::HashIndex;
pub use key::IndexKey;
pub use sst::SstIndex;
pub use vector::{DistanceMetric, HnswConfig, HnswIndex};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Index errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("unique constraint violated on {:?}: value {:?}", index_name, value))]
    UniqueConstraint { index_name: String, value: String },

    #[snafu(display("object store failure: {}", source))]
    Store { source: object_store::Error },

    #[snafu(display("persisted index corrupt: {}", source))]
    Corrupt { source: serde_json::Error },

    #[snafu(display(
        "persisted index has family {:?}, expected {:?}",
        found,
        expected
    ))]
    FamilyMismatch { expected: String, found: String },

    #[snafu(display("vector dimension mismatch: got {}, index holds {}", got, expected))]
    DimensionMismatch { got: usize, expected: usize },

    #[snafu(display("vector node {} is gone from cache and store", node_id))]
    NodeLost { node_id: u64 },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Where an indexed document lives inside its columnar file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocLocation {
    /// Canonical document id.
    pub doc_id: String,
    /// Row group within the data file.
    pub row_group: u64,
    /// Row offset within the row group.
    pub row_offset: u64,
}

impl DocLocation {
    /// Build a location.
    pub fn new(doc_id: impl Into<String>, row_group: u64, row_offset: u64) -> Self {
        Self {
            doc_id: doc_id.into(),
            row_group,
            row_offset,
        }
    }
}

/// Counters common to every index family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Index name.
    pub name: String,
    /// Family tag (`hash`, `sst`, `fts`, `vector`).
    pub family: String,
    /// Distinct keys (terms for FTS, nodes for vector).
    pub keys: u64,
    /// Total entries (postings for FTS).
    pub entries: u64,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}
