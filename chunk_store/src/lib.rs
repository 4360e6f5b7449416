//! The on-disk object tree backing records.
//!
//! Two kinds of files live under `<datapath>/objects/`, both sharded into
//! `xx/yy/zz/<rest>` subdirectories so no directory collects an unbounded
//! number of entries:
//!
//! - **entry files**: append-only streams of CBOR-framed `(pos, value)`
//!   pairs, the persistent half of a buffer list. Location-addressed by a
//!   random UUID path.
//! - **blobs**: immutable byte chunks named by the SHA-1 of their content.
//!
//! Nothing here is ever rewritten in place; deletion is explicit.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use data_types::Value;
use observability_deps::tracing::debug;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

/// Errors talking to the object tree.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("io error on {}: {source}", path.display()))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("corrupt entry stream in {}: {source}", path.display()))]
    Decode {
        path: PathBuf,
        source: ciborium::de::Error<std::io::Error>,
    },

    #[snafu(display("encoding entry for {}: {source}", path.display()))]
    Encode {
        path: PathBuf,
        source: ciborium::ser::Error<std::io::Error>,
    },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Split a hex string into the sharded relative path `xx/yy/zz/<rest>`.
fn shard(hex: &str) -> PathBuf {
    debug_assert!(hex.len() > 6);
    PathBuf::from(&hex[..2]).join(&hex[2..4]).join(&hex[4..6]).join(&hex[6..])
}

/// Pick an unused random path under `base`, creating parent directories.
pub fn random_path(base: &Path) -> Result<PathBuf> {
    loop {
        let hex = Uuid::new_v4().simple().to_string();
        let path = base.join(shard(&hex));
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
            }
            return Ok(path);
        }
    }
}

/// The trailing four components of a sharded path (`xx/yy/zz/<rest>`),
/// the form stored in headers and the catalog.
pub fn relative_path(path: &Path) -> String {
    let parts: Vec<_> = path
        .components()
        .rev()
        .take(4)
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.into_iter().rev().collect::<Vec<_>>().join("/")
}

/// One stored buffer entry: outer position and value.
pub type Entry = (Vec<usize>, Value);

#[derive(Serialize, Deserialize)]
struct WireEntry(Vec<usize>, Value);

/// An append-only stream of entries at a fixed path.
///
/// Writers append whole batches; readers get everything written so far.
/// The file may not exist yet (nothing flushed), which reads as empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFile {
    path: PathBuf,
}

impl EntryFile {
    /// Wrap an existing or to-be-created path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Allocate a fresh random path under `objects_dir`.
    pub fn create_under(objects_dir: &Path) -> Result<Self> {
        Ok(Self {
            path: random_path(objects_dir)?,
        })
    }

    /// The absolute path of this stream.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of entries, creating the file on first use.
    pub fn append_batch(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context(IoSnafu { path: &self.path })?;
        let mut w = BufWriter::new(file);
        for (pos, value) in entries {
            ciborium::into_writer(&WireEntry(pos.clone(), value.clone()), &mut w)
                .context(EncodeSnafu { path: &self.path })?;
        }
        w.flush().context(IoSnafu { path: &self.path })?;
        Ok(())
    }

    /// Every entry written so far, in append order.
    pub fn read_all(&self) -> Result<Vec<Entry>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e).context(IoSnafu { path: &self.path });
            }
        };
        let len = file
            .metadata()
            .context(IoSnafu { path: &self.path })?
            .len();
        let mut r = BufReader::new(file);
        let mut out = vec![];
        let mut consumed = 0u64;
        while consumed < len {
            let mut counting = CountingReader {
                inner: &mut r,
                read: 0,
            };
            let WireEntry(pos, value) = ciborium::from_reader(&mut counting)
                .context(DecodeSnafu { path: &self.path })?;
            consumed += counting.read;
            out.push((pos, value));
        }
        Ok(out)
    }

    /// Remove the file. Missing files are fine (never flushed).
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(IoSnafu { path: &self.path }),
        }
    }
}

struct CountingReader<R> {
    inner: R,
    read: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        Ok(n)
    }
}

/// Content-addressed blob storage: a blob's name is the 40-character
/// SHA-1 hex of its bytes, sharded like every other object path.
#[derive(Debug, Clone)]
pub struct ContentStore {
    base: PathBuf,
}

impl ContentStore {
    /// A store rooted at `base` (usually `<datapath>/objects`).
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn path_of(&self, digest: &str) -> PathBuf {
        self.base.join(shard(digest))
    }

    /// Store a blob, returning its content digest. Re-putting identical
    /// bytes is a no-op.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let digest = hex::encode(Sha1::digest(bytes));
        let path = self.path_of(&digest);
        if path.exists() {
            debug!(%digest, "blob already stored");
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu { path: parent })?;
        }
        // write-then-rename so readers never observe a partial blob
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).context(IoSnafu { path: &tmp })?;
        std::fs::rename(&tmp, &path).context(IoSnafu { path: &path })?;
        Ok(digest)
    }

    /// Fetch a blob by digest.
    pub fn get(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_of(digest)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(IoSnafu {
                path: self.path_of(digest),
            }),
        }
    }

    /// Whether a digest is present.
    pub fn contains(&self, digest: &str) -> bool {
        self.path_of(digest).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_paths_are_sharded_and_unique() {
        let dir = test_helpers::tmp_dir().unwrap();
        let a = random_path(dir.path()).unwrap();
        let b = random_path(dir.path()).unwrap();
        assert_ne!(a, b);

        let rel = relative_path(&a);
        let parts: Vec<_> = rel.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 2);
    }

    #[test]
    fn entry_file_roundtrip_preserves_order() {
        let dir = test_helpers::tmp_dir().unwrap();
        let f = EntryFile::create_under(dir.path()).unwrap();

        f.append_batch(&[
            (vec![0], Value::Int(1)),
            (vec![2], Value::Float(0.5)),
        ])
        .unwrap();
        f.append_batch(&[(vec![1], Value::Str("x".into()))]).unwrap();

        let all = f.read_all().unwrap();
        assert_eq!(
            all,
            vec![
                (vec![0], Value::Int(1)),
                (vec![2], Value::Float(0.5)),
                (vec![1], Value::Str("x".into())),
            ]
        );
    }

    #[test]
    fn unflushed_entry_file_reads_empty() {
        let dir = test_helpers::tmp_dir().unwrap();
        let f = EntryFile::create_under(dir.path()).unwrap();
        assert!(f.read_all().unwrap().is_empty());
        // deleting a never-flushed file is a no-op
        f.delete().unwrap();
    }

    #[test]
    fn content_store_addresses_by_digest() {
        let dir = test_helpers::tmp_dir().unwrap();
        let store = ContentStore::new(dir.path().to_path_buf());

        let d1 = store.put(b"hello").unwrap();
        let d2 = store.put(b"hello").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 40);
        assert!(store.contains(&d1));
        assert_eq!(store.get(&d1).unwrap().unwrap(), b"hello");
        assert_eq!(store.get(&"0".repeat(40)).unwrap(), None);
    }
}
