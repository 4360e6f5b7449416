//! Self-contained export archives.
//!
//! An export is a deflate zip holding `record.hdr` (the serialized
//! header, buffer locations blanked) plus one `<key>.buf` entry stream
//! per buffered variable. The archive reloads into a cache record with
//! no dependency on the original data directory.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use buffer_list::{BufferList, Entry};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    ArchiveSnafu, DecodeHeaderSnafu, EncodeHeaderSnafu, IoSnafu, Item, ItemHeader, Record,
    RecordHeader, Result, Storage,
};

const HEADER_NAME: &str = "record.hdr";

#[derive(Serialize, Deserialize)]
struct WireEntry(Vec<usize>, data_types::Value);

pub(crate) fn write(record: &Record, archive: &Path) -> Result<()> {
    let file = File::create(archive).context(IoSnafu { path: archive })?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    // header first, with chunk locations blanked: the archive is the
    // storage now
    let mut header = record.header();
    for item in header.items.values_mut() {
        if let ItemHeader::Buffer(h) = item {
            h.file = None;
        }
    }
    zip.start_file(HEADER_NAME, options)
        .context(ArchiveSnafu)?;
    let bytes = header.to_bytes()?;
    zip.write_all(&bytes).context(IoSnafu { path: archive })?;

    for (key, item) in &record.items {
        let Item::Buffer(b) = item else { continue };
        zip.start_file(format!("{key}.buf"), options)
            .context(ArchiveSnafu)?;
        let entries = b
            .entries(None)
            .context(crate::BufferSnafu { key })?;
        let mut buf = vec![];
        for (pos, value) in entries {
            ciborium::into_writer(&WireEntry(pos, value), &mut buf)
                .context(EncodeHeaderSnafu)?;
        }
        zip.write_all(&buf).context(IoSnafu { path: archive })?;
    }

    zip.finish().context(ArchiveSnafu)?;
    Ok(())
}

/// Load an export archive back into a cache record.
pub fn load(archive: &Path) -> Result<Record> {
    let file = File::open(archive).context(IoSnafu { path: archive })?;
    let mut zip = ZipArchive::new(file).context(ArchiveSnafu)?;

    let header: RecordHeader = {
        let mut entry = zip.by_name(HEADER_NAME).context(ArchiveSnafu)?;
        let mut bytes = vec![];
        entry
            .read_to_end(&mut bytes)
            .context(IoSnafu { path: archive })?;
        RecordHeader::from_bytes(&bytes).context(DecodeHeaderSnafu { path: archive })?
    };

    let mut items = std::collections::BTreeMap::new();
    for (key, item) in header.items {
        let live = match item {
            ItemHeader::Scalar(v) => Item::Scalar(v),
            ItemHeader::Buffer(h) => {
                let mut entry = zip.by_name(&format!("{key}.buf")).context(ArchiveSnafu)?;
                let mut bytes = vec![];
                entry
                    .read_to_end(&mut bytes)
                    .context(IoSnafu { path: archive })?;
                Item::Buffer(BufferList::from_entries(&h, decode_entries(&bytes, archive)?))
            }
        };
        items.insert(key, live);
    }

    Ok(Record {
        id: header.id,
        description: header.description,
        items,
        storage: Storage::Cache,
        pos: vec![],
        last_vars: Default::default(),
    })
}

fn decode_entries(mut bytes: &[u8], archive: &Path) -> Result<Vec<Entry>> {
    let mut out = vec![];
    while !bytes.is_empty() {
        let rest_before = bytes.len();
        let mut cursor = Counting {
            inner: bytes,
            read: 0,
        };
        let WireEntry(pos, value) =
            ciborium::from_reader(&mut cursor).context(DecodeHeaderSnafu { path: archive })?;
        let consumed = cursor.read;
        debug_assert!(consumed > 0 && consumed <= rest_before);
        bytes = &bytes[consumed..];
        out.push((pos, value));
    }
    Ok(out)
}

struct Counting<R> {
    inner: R,
    read: usize,
}

impl<R: Read> Read for Counting<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n;
        Ok(n)
    }
}
