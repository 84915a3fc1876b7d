//! The append-only event log.
//!
//! Every mutation of every entity is an [`Event`](data_types::Event).
//! Events buffer in the [`EventWriter`] (backed by a write-ahead journal),
//! flush into time-partitioned columnar batches under
//! `events/<Y>/<M>/<D>/<H>/batch-<ts>.parquet`, and are read back through
//! the [`BatchEventSource`] whose scan plan skips batches outside the
//! queried time range. The [`replay`] module folds events back into entity
//! state, optionally short-circuited by [`snapshot`]s.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod log;
pub mod replay;
pub mod snapshot;
mod source;
mod wal;
mod writer;

pub use log::EventLog;
pub use source::{BatchEventSource, EventCursor, ScanPlan};
pub use wal::Wal;
pub use writer::{
    run_flusher, EventWriter, EventWriterConfig, FlushObserver, WriterStats,
};

use snafu::Snafu;

/// Errors of the event-log subsystem.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("object store failure: {}", source))]
    Store { source: object_store::Error },

    #[snafu(display("codec failure: {}", source))]
    Codec { source: columnar::Error },

    #[snafu(display("journal corrupt at line {}: {}", line, source))]
    JournalCorrupt {
        line: usize,
        source: serde_json::Error,
    },

    #[snafu(display("flush observer failed: {}", source))]
    Observer {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("create event replayed onto existing state for {}", target))]
    StateExists { target: String },

    #[snafu(display("snapshot corrupt: {}", source))]
    SnapshotCorrupt {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
