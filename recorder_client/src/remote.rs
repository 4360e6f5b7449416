//! Remote records and the unified local/remote record surface.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use buffer_list::BufferList;
use data_types::{RecordDescription, RecordId, SliceOp, SliceSpec, Value};
use ndarray::ArrayD;
use protocol::{ItemReply, Request, Response};
use snafu::{OptionExt, ResultExt};

use crate::connection::{Connection, DEFAULT_TIMEOUT};
use crate::sync_io::RemoteEntrySource;
use crate::{BufferSnafu, NoSuchKeySnafu, RecordSnafu, Result, ServerSnafu, UnexpectedReplySnafu};

/// One fetched variable.
#[derive(Debug)]
pub enum RecordValue {
    /// A scan-wide scalar.
    Scalar(Value),
    /// A buffer: lazy, and for remote records socket-routed.
    Buffer(BufferList),
}

/// A record whose reads all travel through the recorder socket.
#[derive(Debug, Clone)]
pub struct RemoteRecord {
    url: String,
    id: RecordId,
    description: RecordDescription,
}

impl RemoteRecord {
    pub(crate) fn new(url: String, id: RecordId, description: RecordDescription) -> Self {
        Self {
            url,
            id,
            description,
        }
    }

    /// The record id.
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// The description fetched at open time.
    pub fn description(&self) -> &RecordDescription {
        &self.description
    }

    async fn conn(&self) -> Result<Connection> {
        Connection::connect(&self.url).await
    }

    /// Variable names currently stored.
    pub async fn keys(&self) -> Result<Vec<String>> {
        match self
            .conn()
            .await?
            .request(&Request::RecordKeys { record_id: self.id })
            .await?
        {
            Response::Keys(keys) => Ok(keys),
            _ => UnexpectedReplySnafu {
                method: "record_keys",
            }
            .fail(),
        }
    }

    async fn item_reply(&self, key: &str) -> Result<Option<ItemReply>> {
        match self
            .conn()
            .await?
            .request(&Request::RecordGetitem {
                record_id: self.id,
                key: key.to_string(),
            })
            .await?
        {
            Response::Item(item) => Ok(item),
            _ => UnexpectedReplySnafu {
                method: "record_getitem",
            }
            .fail(),
        }
    }

    /// Fetch one variable as a lazy handle; buffers pull their entries
    /// through the socket on demand.
    pub async fn item(&self, key: &str) -> Result<Option<RecordValue>> {
        Ok(self.item_reply(key).await?.map(|item| match item {
            ItemReply::Scalar(v) => RecordValue::Scalar(v),
            ItemReply::Buffer(header) => {
                let source = RemoteEntrySource {
                    url: self.url.clone(),
                    record_id: self.id,
                    key: key.to_string(),
                    timeout: DEFAULT_TIMEOUT,
                };
                RecordValue::Buffer(BufferList::remote(&header, Arc::new(source)))
            }
        }))
    }

    async fn entries(&self, key: &str, slice: Option<&SliceSpec>) -> Result<Vec<buffer_list::Entry>> {
        match self
            .conn()
            .await?
            .request(&Request::BufferlistSlice {
                record_id: self.id,
                key: key.to_string(),
                slice: slice.cloned(),
            })
            .await?
        {
            Response::Entries(entries) => Ok(entries),
            _ => UnexpectedReplySnafu {
                method: "bufferlist_slice",
            }
            .fail(),
        }
    }

    /// Dense read of one variable, slicing applied in a single exchange.
    pub async fn get_array(&self, key: &str, slice: Option<&SliceSpec>) -> Result<ArrayD<Value>> {
        let item = self
            .item_reply(key)
            .await?
            .context(NoSuchKeySnafu { key })?;
        match item {
            ItemReply::Scalar(v) => Ok(ndarray::arr0(v).into_dyn()),
            ItemReply::Buffer(header) => {
                // the server filters outer positions; inner narrowing and
                // axis collapse/reversal happen locally on the spec
                let outer = header.lu.len();
                let fetch_spec = slice.map(|spec| {
                    let inner = header
                        .inner_shape
                        .as_ref()
                        .map(Vec::len)
                        .unwrap_or_default();
                    let expanded = spec.expand(outer + inner);
                    SliceSpec(
                        expanded
                            .into_iter()
                            .take(outer)
                            .map(|op| match op {
                                SliceOp::Index(_) | SliceOp::Range { .. } => op,
                                SliceOp::Ellipsis => SliceOp::full(),
                            })
                            .collect(),
                    )
                });
                let entries = self.entries(key, fetch_spec.as_ref()).await?;
                let local = BufferList::from_entries(&header, entries);
                match slice {
                    Some(spec) => local.get(spec).context(BufferSnafu),
                    None => local.array().context(BufferSnafu),
                }
            }
        }
    }

    /// Delete the record on the server.
    pub async fn delete(&self) -> Result<()> {
        match self
            .conn()
            .await?
            .request(&Request::RecordDelete { record_id: self.id })
            .await?
        {
            Response::Empty => Ok(()),
            Response::Error(message) => ServerSnafu { message }.fail(),
            _ => UnexpectedReplySnafu {
                method: "record_delete",
            }
            .fail(),
        }
    }

    /// Pull everything and write a self-contained export archive.
    pub async fn export(&self, archive: &Path) -> Result<()> {
        let mut items = BTreeMap::new();
        for key in self.keys().await? {
            let Some(item) = self.item_reply(&key).await? else {
                continue;
            };
            let live = match item {
                ItemReply::Scalar(v) => record::Item::Scalar(v),
                ItemReply::Buffer(header) => {
                    let entries = self.entries(&key, None).await?;
                    record::Item::Buffer(BufferList::from_entries(&header, entries))
                }
            };
            items.insert(key, live);
        }
        let snapshot =
            record::Record::assemble_cache(Some(self.id), self.description.clone(), items);
        snapshot.export(archive).context(RecordSnafu)
    }
}

/// A record fetched by [`crate::get_record`]: locally opened or
/// socket-routed, with the same data visible either way.
#[derive(Debug)]
pub enum ClientRecord {
    /// Header and chunks opened in place.
    Local(record::Record),
    /// Reads travel through the recorder.
    Remote(RemoteRecord),
}

impl ClientRecord {
    /// The record's description.
    pub fn description(&self) -> &RecordDescription {
        match self {
            Self::Local(r) => r.description(),
            Self::Remote(r) => r.description(),
        }
    }

    /// Variable names.
    pub async fn keys(&self) -> Result<Vec<String>> {
        match self {
            Self::Local(r) => Ok(r.keys()),
            Self::Remote(r) => r.keys().await,
        }
    }

    /// Dense read of one variable.
    pub async fn get_array(&self, key: &str, slice: Option<&SliceSpec>) -> Result<ArrayD<Value>> {
        match self {
            Self::Local(r) => r.get_array(key, slice).context(RecordSnafu),
            Self::Remote(r) => r.get_array(key, slice).await,
        }
    }

    /// Fetch one variable as a lazy handle.
    pub async fn item(&self, key: &str) -> Result<Option<RecordValue>> {
        match self {
            Self::Local(r) => Ok(r.item_header(key).map(|h| match h {
                record::ItemHeader::Scalar(v) => RecordValue::Scalar(v),
                record::ItemHeader::Buffer(header) => {
                    let file = match r.item(key) {
                        Some(record::Item::Buffer(b)) => b.chunk_file().cloned(),
                        _ => None,
                    };
                    RecordValue::Buffer(BufferList::from_header(&header, file))
                }
            })),
            Self::Remote(r) => r.item(key).await,
        }
    }

    /// Delete the record and its data.
    pub async fn delete(self) -> Result<()> {
        match self {
            Self::Local(mut r) => r.delete().context(RecordSnafu),
            Self::Remote(r) => r.delete().await,
        }
    }

    /// Write a self-contained export archive.
    pub async fn export(&self, archive: &Path) -> Result<()> {
        match self {
            Self::Local(r) => r.export(archive).context(RecordSnafu),
            Self::Remote(r) => r.export(archive).await,
        }
    }
}
