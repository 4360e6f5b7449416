//! Where a scan's emissions go: the recorder socket, a local data
//! directory, or an in-process cache record.

use std::collections::BTreeMap;

use chrono::Utc;
use data_types::{RecordDescription, RecordId, Value};
use observability_deps::tracing::debug;
use record::Record;
use recorder_client::{BackoffConfig, Connection, Database};
use snafu::ResultExt;

use crate::{CatalogSnafu, ClientSnafu, RecordSnafu, Result};

/// See the module docs.
#[derive(Debug)]
pub(crate) enum Sink {
    Remote {
        conn: Connection,
        id: RecordId,
    },
    Local {
        record: Record,
    },
    Cache {
        record: Record,
    },
}

impl Sink {
    /// Create the record on the right side of the socket.
    pub(crate) async fn open(database: &Database, description: RecordDescription) -> Result<Self> {
        match database {
            Database::Url(url) => {
                let mut conn =
                    Connection::connect_with_retries(url, &BackoffConfig::default(), 3)
                        .await
                        .context(ClientSnafu)?;
                let id = conn.record_create(&description).await.context(ClientSnafu)?;
                debug!(%id, "remote record created");
                Ok(Self::Remote { conn, id })
            }
            Database::Path(path) => {
                let app = description.app.clone();
                let tags = description.tags.clone();
                let ctime = description.ctime.unwrap_or_else(Utc::now);
                let mut record =
                    Record::create_local(path, description).context(RecordSnafu)?;
                let catalog = record_catalog::Catalog::open(path)
                    .await
                    .context(CatalogSnafu)?;
                let file = record
                    .header_relative_path()
                    .expect("local records always have a header path");
                let id = catalog
                    .create(&file, &app, ctime, &tags)
                    .await
                    .context(CatalogSnafu)?;
                record.set_id(id);
                record.flush().context(RecordSnafu)?;
                debug!(%id, "local record created");
                Ok(Self::Local { record })
            }
            Database::Cache => Ok(Self::Cache {
                record: Record::cache(description),
            }),
        }
    }

    /// The record id, when one was assigned.
    pub(crate) fn record_id(&self) -> Option<RecordId> {
        match self {
            Self::Remote { id, .. } => Some(*id),
            Self::Local { record } | Self::Cache { record } => record.id(),
        }
    }

    /// Forward one emission.
    pub(crate) async fn append(
        &mut self,
        level: i64,
        step: u64,
        position: u64,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        match self {
            Self::Remote { conn, id } => conn
                .record_append(*id, level, step, position, variables)
                .await
                .context(ClientSnafu),
            Self::Local { record } | Self::Cache { record } => record
                .append(level, step as usize, position as usize, variables)
                .context(RecordSnafu),
        }
    }

    /// Close out the record; the cache variant hands itself back for
    /// in-process reads.
    pub(crate) async fn finish(&mut self) -> Result<()> {
        match self {
            // the final level -1 append already flushed server-side
            Self::Remote { .. } => Ok(()),
            Self::Local { record } | Self::Cache { record } => {
                record.flush().context(RecordSnafu)
            }
        }
    }

    /// Take the in-process record out of a cache sink.
    pub(crate) fn into_cache_record(self) -> Option<Record> {
        match self {
            Self::Cache { record } => Some(record),
            _ => None,
        }
    }
}
