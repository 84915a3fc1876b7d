//! Small helpers shared by the crates' test suites.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs, clippy::explicit_iter_loop, clippy::use_self)]

use std::sync::Once;

static LOG_SETUP: Once = Once::new();

/// Enable tracing output for a test, honoring `RUST_LOG`.
///
/// Safe to call from every test; initialization happens once.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Unconditionally enable tracing output for a test.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// A temp directory that cleans itself up when dropped.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    let _ = std::fs::create_dir_all(std::env::temp_dir());
    tempfile::Builder::new()
        .prefix("parquedb")
        .tempdir()
}

/// A temp file that cleans itself up when dropped.
pub fn tmp_file() -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new().prefix("parquedb").tempfile()
}
