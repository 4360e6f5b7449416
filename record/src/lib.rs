//! A record is one scan's complete result: its description, a map of
//! variables (scan-wide scalars or incrementally filled buffers) and a
//! self-contained serialized header file.
//!
//! Records come in two flavours here: *local* (header and chunk files
//! under a data directory) and *cache* (purely in memory, nothing
//! persisted). Remote records, whose reads travel over the recorder
//! socket, are assembled by the client crate from the same headers.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use buffer_list::{BufferHeader, BufferList, Entry, EntryFile};
use data_types::{RecordDescription, RecordId, SliceSpec, Value};
use ndarray::ArrayD;
use observability_deps::tracing::debug;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

mod export;

pub use export::load as load_export;

/// Errors raised by record operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("io error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("buffer error for {key:?}: {source}"))]
    Buffer {
        key: String,
        source: buffer_list::Error,
    },

    #[snafu(display("object tree error: {source}"))]
    Chunk { source: chunk_store::Error },

    #[snafu(display("corrupt record header at {}: {source}", path.display()))]
    DecodeHeader {
        path: PathBuf,
        source: ciborium::de::Error<std::io::Error>,
    },

    #[snafu(display("serializing record header: {source}"))]
    EncodeHeader {
        source: ciborium::ser::Error<std::io::Error>,
    },

    #[snafu(display("no variable {key:?} in record"))]
    NoSuchKey { key: String },

    #[snafu(display("export archive error: {source}"))]
    Archive { source: zip::result::ZipError },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One serialized variable in a record header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemHeader {
    /// A scan-wide scalar, stored inline.
    Scalar(Value),
    /// A buffer, stored as bounds plus the chunk-file location.
    Buffer(BufferHeader),
}

/// The self-contained serialized form of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Catalog id, absent for cache records.
    pub id: Option<RecordId>,
    /// The scan description captured at creation.
    pub description: RecordDescription,
    /// Variable name → stored form.
    pub items: BTreeMap<String, ItemHeader>,
}

impl RecordHeader {
    /// Deserialize a header from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![];
        ciborium::into_writer(self, &mut buf).context(EncodeHeaderSnafu)?;
        Ok(buf)
    }
}

/// One live variable of a record.
#[derive(Debug)]
pub enum Item {
    /// A scan-wide scalar.
    Scalar(Value),
    /// An incrementally filled buffer.
    Buffer(BufferList),
}

/// Where a record's bytes live.
#[derive(Debug, Clone, PartialEq)]
enum Storage {
    /// In memory only.
    Cache,
    /// Under `<datapath>/objects/`, with a header file.
    Local {
        datapath: PathBuf,
        header_file: PathBuf,
    },
}

/// See the crate docs.
#[derive(Debug)]
pub struct Record {
    id: Option<RecordId>,
    description: RecordDescription,
    items: BTreeMap<String, Item>,
    storage: Storage,
    pos: Vec<usize>,
    last_vars: BTreeSet<String>,
}

impl Record {
    /// A record persisted under `datapath`: allocates the header file in
    /// the object tree immediately so its path can enter the catalog.
    pub fn create_local(datapath: &Path, description: RecordDescription) -> Result<Self> {
        let objects = datapath.join("objects");
        let header_file = chunk_store::random_path(&objects).context(ChunkSnafu)?;
        let record = Self {
            id: None,
            description,
            items: BTreeMap::new(),
            storage: Storage::Local {
                datapath: datapath.to_path_buf(),
                header_file,
            },
            pos: vec![],
            last_vars: BTreeSet::new(),
        };
        record.write_header()?;
        Ok(record)
    }

    /// An in-memory record with no persistence.
    pub fn cache(description: RecordDescription) -> Self {
        Self {
            id: None,
            description,
            items: BTreeMap::new(),
            storage: Storage::Cache,
            pos: vec![],
            last_vars: BTreeSet::new(),
        }
    }

    /// An in-memory record assembled from already-fetched items (loaded
    /// archives, remote snapshots).
    pub fn assemble_cache(
        id: Option<RecordId>,
        description: RecordDescription,
        items: BTreeMap<String, Item>,
    ) -> Self {
        Self {
            id,
            description,
            items,
            storage: Storage::Cache,
            pos: vec![],
            last_vars: BTreeSet::new(),
        }
    }

    /// Reopen a record from its header file, resolving buffer chunk
    /// paths against the data root.
    pub fn open(datapath: &Path, header_file: &Path) -> Result<Self> {
        let mut bytes = vec![];
        File::open(header_file)
            .context(IoSnafu { path: header_file })?
            .read_to_end(&mut bytes)
            .context(IoSnafu { path: header_file })?;
        let header: RecordHeader =
            RecordHeader::from_bytes(&bytes).context(DecodeHeaderSnafu { path: header_file })?;

        let objects = datapath.join("objects");
        let items = header
            .items
            .into_iter()
            .map(|(key, item)| {
                let item = match item {
                    ItemHeader::Scalar(v) => Item::Scalar(v),
                    ItemHeader::Buffer(h) => {
                        let file = h
                            .file
                            .as_ref()
                            .map(|rel| EntryFile::new(objects.join(rel)));
                        Item::Buffer(BufferList::from_header(&h, file))
                    }
                };
                (key, item)
            })
            .collect();

        Ok(Self {
            id: header.id,
            description: header.description,
            items,
            storage: Storage::Local {
                datapath: datapath.to_path_buf(),
                header_file: header_file.to_path_buf(),
            },
            pos: vec![],
            last_vars: BTreeSet::new(),
        })
    }

    /// Catalog id, once assigned.
    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    /// Attach the catalog id (done once, by the recorder).
    pub fn set_id(&mut self, id: RecordId) {
        self.id = Some(id);
    }

    /// The captured scan description.
    pub fn description(&self) -> &RecordDescription {
        &self.description
    }

    /// The header file path relative to the object tree, for the catalog
    /// row. `None` for cache records.
    pub fn header_relative_path(&self) -> Option<String> {
        match &self.storage {
            Storage::Local { header_file, .. } => Some(chunk_store::relative_path(header_file)),
            Storage::Cache => None,
        }
    }

    /// Variable names stored so far.
    pub fn keys(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    /// Borrow a stored variable.
    pub fn item(&self, key: &str) -> Option<&Item> {
        self.items.get(key)
    }

    /// The wire form of a stored variable, buffer chunk paths relative
    /// to the data root.
    pub fn item_header(&self, key: &str) -> Option<ItemHeader> {
        self.items.get(key).map(|item| match item {
            Item::Scalar(v) => ItemHeader::Scalar(v.clone()),
            Item::Buffer(b) => {
                let rel = b.chunk_file().map(|f| chunk_store::relative_path(f.path()));
                ItemHeader::Buffer(b.header(rel))
            }
        })
    }

    /// Entries of a buffered variable surviving `slice`; scalars have no
    /// entries.
    pub fn entries(&self, key: &str, slice: Option<&SliceSpec>) -> Result<Vec<Entry>> {
        match self.items.get(key).context(NoSuchKeySnafu { key })? {
            Item::Buffer(b) => b.entries(slice).context(BufferSnafu { key }),
            Item::Scalar(_) => Ok(vec![]),
        }
    }

    /// Dense read of a variable: scalars come back as 0-d arrays.
    pub fn get_array(&self, key: &str, slice: Option<&SliceSpec>) -> Result<ArrayD<Value>> {
        match self.items.get(key).context(NoSuchKeySnafu { key })? {
            Item::Scalar(v) => Ok(ndarray::arr0(v.clone()).into_dyn()),
            Item::Buffer(b) => match slice {
                Some(spec) => b.get(spec).context(BufferSnafu { key }),
                None => b.array().context(BufferSnafu { key }),
            },
        }
    }

    /// Accept one emission from the owning scan.
    ///
    /// `level` is the nesting depth the emission belongs to (`-1` flushes
    /// and ends the record), `step` the scan-wide iteration counter,
    /// `position` the iteration index at that level. Variables are
    /// stored per their axis: scalars once, buffered variables whenever
    /// the emission level is their innermost axis.
    pub fn append(
        &mut self,
        level: i64,
        _step: usize,
        position: usize,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        if level < 0 {
            return self.flush();
        }
        let level = level as usize;

        for key in variables.keys() {
            if !self.last_vars.contains(key) && !self.description.axis.contains_key(key) {
                self.description
                    .axis
                    .insert(key.clone(), (0..=level).collect());
            }
        }
        self.last_vars = variables.keys().cloned().collect();

        // maintain the per-level position vector; on ascent the stale
        // deeper entries are dropped and the level is bumped afterwards
        // so change detection sees a fresh outer index
        let pos;
        if level >= self.pos.len() {
            let missing = level + 1 - self.pos.len();
            self.pos.extend(std::iter::repeat(0).take(missing - 1));
            self.pos.push(position);
            pos = self.pos.clone();
        } else if level == self.pos.len() - 1 {
            self.pos[level] = position;
            pos = self.pos.clone();
        } else {
            self.pos.truncate(level + 1);
            self.pos[level] = position;
            pos = self.pos.clone();
            self.pos[level] += 1;
        }

        for (key, value) in variables {
            let axis = self
                .description
                .axis
                .get(&key)
                .cloned()
                .unwrap_or_default();
            if axis.is_empty() {
                self.items.entry(key).or_insert(Item::Scalar(value));
                continue;
            }
            if axis.last() != Some(&level) {
                continue;
            }
            if !self.items.contains_key(&key) {
                let buffer = match &self.storage {
                    Storage::Local { datapath, .. } => {
                        let file = EntryFile::create_under(&datapath.join("objects"))
                            .context(ChunkSnafu)?;
                        BufferList::file(file)
                    }
                    Storage::Cache => BufferList::cache(),
                };
                self.items.insert(key.clone(), Item::Buffer(buffer));
            }
            if let Some(Item::Buffer(b)) = self.items.get(&key) {
                b.append(&pos, value, Some(&axis))
                    .context(BufferSnafu { key: &key })?;
            }
        }
        Ok(())
    }

    fn header(&self) -> RecordHeader {
        let items = self
            .items
            .iter()
            .map(|(key, item)| {
                let h = match item {
                    Item::Scalar(v) => ItemHeader::Scalar(v.clone()),
                    Item::Buffer(b) => {
                        let rel = b.chunk_file().map(|f| chunk_store::relative_path(f.path()));
                        ItemHeader::Buffer(b.header(rel))
                    }
                };
                (key.clone(), h)
            })
            .collect();
        RecordHeader {
            id: self.id,
            description: self.description.clone(),
            items,
        }
    }

    fn write_header(&self) -> Result<()> {
        let Storage::Local { header_file, .. } = &self.storage else {
            return Ok(());
        };
        let bytes = self.header().to_bytes()?;
        let mut f = File::create(header_file).context(IoSnafu { path: header_file })?;
        f.write_all(&bytes).context(IoSnafu { path: header_file })?;
        Ok(())
    }

    /// Flush every buffer and rewrite the header file.
    pub fn flush(&mut self) -> Result<()> {
        for (key, item) in &self.items {
            if let Item::Buffer(b) = item {
                b.flush().context(BufferSnafu { key })?;
            }
        }
        self.write_header()
    }

    /// Unlink every chunk file and the header.
    pub fn delete(&mut self) -> Result<()> {
        for (key, item) in &self.items {
            if let Item::Buffer(b) = item {
                b.delete().context(BufferSnafu { key })?;
            }
        }
        if let Storage::Local { header_file, .. } = &self.storage {
            match std::fs::remove_file(header_file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %header_file.display(), "header already gone");
                }
                Err(e) => return Err(e).context(IoSnafu { path: header_file }),
            }
        }
        self.items.clear();
        Ok(())
    }

    /// Write a self-contained export archive; see [`load_export`].
    pub fn export(&self, archive: &Path) -> Result<()> {
        export::write(self, archive)
    }
}
