//! Read/write client for the recorder daemon.
//!
//! One scan holds a [`Connection`] for the lifetime of its record;
//! readers usually go through [`get_record`], which hands back either a
//! locally opened record or a socket-routed remote one, with identical
//! data either way.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::path::PathBuf;

use data_types::RecordId;
use snafu::{OptionExt, ResultExt, Snafu};

mod backoff;
mod connection;
mod remote;
mod sync_io;

pub use backoff::{Backoff, BackoffConfig};
pub use connection::{Connection, DEFAULT_TIMEOUT, PING_TIMEOUT};
pub use remote::{ClientRecord, RecordValue, RemoteRecord};

/// Where a scan's data lives, from a client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Database {
    /// A recorder daemon, `tcp://host:port`.
    Url(String),
    /// A local data directory.
    Path(PathBuf),
    /// Nowhere: keep everything in process memory.
    Cache,
}

impl Database {
    /// Parse the user-facing database parameter: `tcp://` URLs go remote,
    /// everything else is a local path.
    pub fn parse(s: &str) -> Self {
        if s.starts_with("tcp://") {
            Self::Url(s.to_string())
        } else {
            Self::Path(PathBuf::from(s))
        }
    }
}

/// Strip the URL scheme down to `host:port`.
pub(crate) fn host_port(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

/// Client-side errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("connecting to {addr}: {source}"))]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[snafu(display("socket error: {source}"))]
    Socket { source: std::io::Error },

    #[snafu(display("request timed out after {millis} ms"))]
    Timeout { millis: u128 },

    #[snafu(display("connection closed by server"))]
    ConnectionClosed,

    #[snafu(display("payload error: {source}"))]
    Payload { source: protocol::Error },

    #[snafu(display("server answered with an error: {message}"))]
    Server { message: String },

    #[snafu(display("unexpected reply to {method}"))]
    UnexpectedReply { method: &'static str },

    #[snafu(display("catalog error: {source}"))]
    Catalog { source: record_catalog::Error },

    #[snafu(display("record error: {source}"))]
    Record { source: record::Error },

    #[snafu(display("buffer error: {source}"))]
    Buffer { source: buffer_list::Error },

    #[snafu(display("no record with id {id}"))]
    NoSuchRecord { id: RecordId },

    #[snafu(display("record has no variable {key:?}"))]
    NoSuchKey { key: String },

    #[snafu(display("a cache database holds no addressable records"))]
    CacheNotAddressable,
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fetch a record by id from either side of the socket.
///
/// For a daemon URL the returned record routes every read back through
/// the server; for a data directory the catalog row is looked up and the
/// header file opened in place.
pub async fn get_record(id: RecordId, database: &Database) -> Result<ClientRecord> {
    match database {
        Database::Url(url) => {
            let mut conn = Connection::connect(url).await?;
            let description = conn.record_description(id).await?;
            Ok(ClientRecord::Remote(RemoteRecord::new(
                url.clone(),
                id,
                description,
            )))
        }
        Database::Path(path) => {
            let catalog = record_catalog::Catalog::open(path)
                .await
                .context(CatalogSnafu)?;
            let file = catalog
                .file_of(id)
                .await
                .context(CatalogSnafu)?
                .context(NoSuchRecordSnafu { id })?;
            let header = path.join("objects").join(file);
            let record = record::Record::open(path, &header).context(RecordSnafu)?;
            Ok(ClientRecord::Local(record))
        }
        Database::Cache => CacheNotAddressableSnafu.fail(),
    }
}

/// Filtered record listing from either side of the socket.
pub async fn query_records(
    database: &Database,
    params: &record_catalog::QueryParams,
) -> Result<data_types::RecordListing> {
    match database {
        Database::Url(url) => {
            let mut conn = Connection::connect(url).await?;
            conn.record_query(params).await
        }
        Database::Path(path) => record_catalog::Catalog::open(path)
            .await
            .context(CatalogSnafu)?
            .query(params)
            .await
            .context(CatalogSnafu),
        Database::Cache => CacheNotAddressableSnafu.fail(),
    }
}
