//! Shared data types for the ParqueDB core: entity identities, document
//! values, events, snapshots and per-namespace manifests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod document;
mod entity;
mod event;
mod ids;
mod manifest;
mod schema;
mod snapshot;
mod value;

pub use document::*;
pub use entity::*;
pub use event::*;
pub use ids::*;
pub use manifest::*;
pub use schema::*;
pub use snapshot::*;
pub use value::*;
