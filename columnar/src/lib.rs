//! Columnar file encoding behind the [`ColumnarCodec`] contract.
//!
//! Callers treat the codec as a black box that turns rows into bytes and
//! back and exposes per-file column statistics for pruning. The one real
//! implementation is [`ParquetCodec`]; the statistics ride inside the
//! Parquet key-value metadata so pruning never needs to decode row groups.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod parquet_codec;
mod stats;

pub use parquet_codec::ParquetCodec;
pub use stats::{ColumnStats, FileStats};

use bytes::Bytes;
use data_types::{Document, Event, NamespaceSchema};
use snafu::Snafu;
use std::fmt::Debug;

/// Codec errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("failed to encode columnar file: {}", source))]
    Encode {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("failed to decode columnar file: {}", source))]
    Decode {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("file carries no readable statistics"))]
    MissingStats,

    #[snafu(display("malformed row at index {}: {}", index, reason))]
    MalformedRow { index: usize, reason: String },
}

/// Codec result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An encoded file plus the statistics computed while encoding it.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// The file bytes.
    pub bytes: Bytes,
    /// Statistics over the encoded rows.
    pub stats: FileStats,
}

/// Encode/decode contract for columnar data files.
///
/// Two row shapes exist: entity rows (open documents with a declared set
/// of typed columns) and event rows (the fixed event-batch schema).
pub trait ColumnarCodec: Debug + Send + Sync + 'static {
    /// Encode entity rows. Typed columns from `schema` are materialized as
    /// real columns (and contribute min/max statistics); the full document
    /// always rides along for lossless decoding.
    fn encode_rows(&self, schema: &NamespaceSchema, rows: &[Document]) -> Result<EncodedFile>;

    /// Decode entity rows.
    fn decode_rows(&self, bytes: &Bytes) -> Result<Vec<Document>>;

    /// Encode an event batch in `(ts, id)` order.
    fn encode_events(&self, events: &[Event]) -> Result<EncodedFile>;

    /// Decode an event batch.
    fn decode_events(&self, bytes: &Bytes) -> Result<Vec<Event>>;

    /// Read back the statistics of an encoded file without decoding rows.
    fn read_stats(&self, bytes: &Bytes) -> Result<FileStats>;
}
