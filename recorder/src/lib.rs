//! The recorder daemon: one authoritative process per data directory,
//! multiplexing every concurrent scan and reader over a request/reply
//! socket.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::path::PathBuf;
use std::time::Duration;

use snafu::Snafu;

mod cache;
mod handler;
mod server;

pub use cache::RecordCache;
pub use handler::Recorder;
pub use server::{ping, watch_or_serve, Server, ServeOutcome};

/// Recorder configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// TCP port to serve on.
    pub port: u16,
    /// Data directory holding `data.db` and `objects/`.
    pub datapath: PathBuf,
    /// Catalog database URL; defaults to SQLite inside `datapath`.
    pub db_url: Option<String>,
    /// How long to wait for an existing daemon's pong before serving.
    pub ping_timeout: Duration,
}

impl RecorderConfig {
    /// Config with defaults for everything but the data directory.
    pub fn new(datapath: impl Into<PathBuf>) -> Self {
        Self {
            port: protocol::DEFAULT_PORT,
            datapath: datapath.into(),
            db_url: None,
            ping_timeout: Duration::from_secs(1),
        }
    }
}

/// Errors starting or running the daemon.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("catalog error: {source}"))]
    Catalog { source: record_catalog::Error },

    #[snafu(display("record error: {source}"))]
    Record { source: record::Error },

    #[snafu(display("io error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("binding port {port}: {source}"))]
    Bind { port: u16, source: std::io::Error },

    #[snafu(display("payload error: {source}"))]
    Payload { source: protocol::Error },

    #[snafu(display("no record with id {id}"))]
    NoSuchRecord { id: data_types::RecordId },

    #[snafu(display("loading record {id}: {message}"))]
    Load {
        id: data_types::RecordId,
        message: String,
    },

    #[snafu(display("method not served here: {method}"))]
    WrongServer { method: &'static str },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
