//! Request dispatch against the daemon state.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use observability_deps::tracing::{debug, warn};
use protocol::{ItemReply, Request, Response};
use record::Record;
use record_catalog::{Catalog, QueryParams};
use snafu::ResultExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::{RecordCache, DEFAULT_CACHE_ENTRIES};
use crate::{CatalogSnafu, PayloadSnafu, RecordSnafu, Result};

/// Shared daemon state: the catalog, the object tree root and the open
/// record cache.
#[derive(Debug)]
pub struct Recorder {
    catalog: Catalog,
    datapath: PathBuf,
    cache: RecordCache,
}

impl Recorder {
    /// State over an opened catalog and data directory.
    pub fn new(catalog: Catalog, datapath: PathBuf) -> Self {
        Self {
            catalog,
            datapath,
            cache: RecordCache::new(DEFAULT_CACHE_ENTRIES),
        }
    }

    async fn record(&self, id: data_types::RecordId) -> Result<Arc<AsyncMutex<Record>>> {
        self.cache
            .get_or_load(id, &self.catalog, &self.datapath)
            .await
    }

    /// Apply one request. `Ok(None)` means "no reply" (appends).
    ///
    /// Failures never propagate to the socket loop: [`handle`] converts
    /// them into an error reply so the client fails fast.
    async fn dispatch(&self, req: Request) -> Result<Option<Response>> {
        match req {
            Request::Ping => Ok(Some(Response::Pong)),

            Request::RecordCreate { description } => {
                let description =
                    protocol::decode_description(&description).context(PayloadSnafu)?;
                let app = description.app.clone();
                let tags = description.tags.clone();
                let ctime = description.ctime.unwrap_or_else(Utc::now);

                let mut record =
                    Record::create_local(&self.datapath, description).context(RecordSnafu)?;
                let file = record
                    .header_relative_path()
                    .expect("local records always have a header path");
                let id = self
                    .catalog
                    .create(&file, &app, ctime, &tags)
                    .await
                    .context(CatalogSnafu)?;
                record.set_id(id);
                record.flush().context(RecordSnafu)?;

                debug!(%id, app, "record created");
                self.cache.insert(id, Arc::new(AsyncMutex::new(record)));
                Ok(Some(Response::RecordId(id)))
            }

            Request::RecordAppend {
                record_id,
                level,
                step,
                position,
                variables,
            } => {
                let record = self.record(record_id).await?;
                record
                    .lock()
                    .await
                    .append(level, step as usize, position as usize, variables)
                    .context(RecordSnafu)?;
                Ok(None)
            }

            Request::RecordDescription { record_id } => {
                let record = self.record(record_id).await?;
                let bytes = {
                    let r = record.lock().await;
                    protocol::encode_description(r.description()).context(PayloadSnafu)?
                };
                Ok(Some(Response::Description(bytes)))
            }

            Request::RecordGetitem { record_id, key } => {
                let record = self.record(record_id).await?;
                let item = record.lock().await.item_header(&key).map(|h| match h {
                    record::ItemHeader::Scalar(v) => ItemReply::Scalar(v),
                    record::ItemHeader::Buffer(b) => ItemReply::Buffer(b),
                });
                Ok(Some(Response::Item(item)))
            }

            Request::RecordKeys { record_id } => {
                let record = self.record(record_id).await?;
                let keys = record.lock().await.keys();
                Ok(Some(Response::Keys(keys)))
            }

            Request::BufferlistSlice {
                record_id,
                key,
                slice,
            } => {
                let record = self.record(record_id).await?;
                let entries = record
                    .lock()
                    .await
                    .entries(&key, slice.as_ref())
                    .context(RecordSnafu)?;
                Ok(Some(Response::Entries(entries)))
            }

            Request::RecordQuery {
                app,
                tags,
                offset,
                limit,
                before,
                after,
            } => {
                let listing = self
                    .catalog
                    .query(&QueryParams {
                        offset,
                        limit,
                        app,
                        tags,
                        before,
                        after,
                    })
                    .await
                    .context(CatalogSnafu)?;
                Ok(Some(Response::Query(listing)))
            }

            Request::RecordDelete { record_id } => {
                let record = self.record(record_id).await?;
                record.lock().await.delete().context(RecordSnafu)?;
                self.cache.remove(record_id);
                self.catalog.delete(record_id).await.context(CatalogSnafu)?;
                debug!(id = %record_id, "record deleted");
                Ok(Some(Response::Empty))
            }

            Request::Submit { .. } => crate::WrongServerSnafu { method: "submit" }.fail(),
            Request::GetRecordId { .. } => crate::WrongServerSnafu {
                method: "get_record_id",
            }
            .fail(),
        }
    }

    /// Apply one request, converting every failure into an error reply.
    pub async fn handle(&self, req: Request) -> Option<Response> {
        let method = method_name(&req);
        match self.dispatch(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(method, error = %e, "request failed");
                Some(Response::Error(e.to_string()))
            }
        }
    }
}

fn method_name(req: &Request) -> &'static str {
    match req {
        Request::Ping => "ping",
        Request::RecordCreate { .. } => "record_create",
        Request::RecordAppend { .. } => "record_append",
        Request::RecordDescription { .. } => "record_description",
        Request::RecordGetitem { .. } => "record_getitem",
        Request::RecordKeys { .. } => "record_keys",
        Request::BufferlistSlice { .. } => "bufferlist_slice",
        Request::RecordQuery { .. } => "record_query",
        Request::RecordDelete { .. } => "record_delete",
        Request::Submit { .. } => "submit",
        Request::GetRecordId { .. } => "get_record_id",
    }
}
