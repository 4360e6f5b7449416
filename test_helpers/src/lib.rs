//! Scaffolding shared by tests across the workspace.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use std::sync::Once;

use observability_deps::tracing::info;
use tracing_subscriber::EnvFilter;

/// Create a scratch directory that is removed on drop.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    let _ = std::fs::create_dir_all("/tmp");
    tempfile::Builder::new()
        .prefix("labscan_test")
        .tempdir_in("/tmp")
}

static LOG_SETUP: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`, if one was requested.
///
/// Safe to call from every test; only the first call does anything.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Install a test subscriber honouring `RUST_LOG`.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
        info!("test logging initialized");
    });
}
