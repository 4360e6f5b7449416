//! The wire vocabulary between scan runners, readers and the recorder.
//!
//! Every message is one length-delimited frame carrying a CBOR map; the
//! request map's `method` tag selects the operation. Replies are a single
//! frame; a handler failure answers with the error variant so clients
//! fail fast instead of hanging. `record_append` is fire-and-forget and
//! gets no reply at all.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::BTreeMap;

use buffer_list::BufferHeader;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use data_types::{RecordDescription, RecordId, RecordListing, ScanId, SliceSpec, Value};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Frames larger than this are rejected at the codec.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Default recorder port.
pub const DEFAULT_PORT: u16 = 6789;

/// Errors encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Payload would not serialize.
    #[error("encoding payload: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    /// Frame bytes were not a valid payload.
    #[error("decoding payload: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Liveness probe.
    Ping,
    /// Create a record from a serialized description; replies with the
    /// assigned id.
    RecordCreate {
        /// Serialized [`RecordDescription`]; see [`encode_description`].
        description: Vec<u8>,
    },
    /// Append one emission to a record. No reply.
    RecordAppend {
        /// Target record.
        record_id: RecordId,
        /// Nesting level of the emission, `-1` flushes.
        level: i64,
        /// Scan-wide iteration counter.
        step: u64,
        /// Iteration index at `level`.
        position: u64,
        /// The emitted variables.
        variables: BTreeMap<String, Value>,
    },
    /// Fetch the serialized description of a record.
    RecordDescription {
        /// Target record.
        record_id: RecordId,
    },
    /// Fetch one variable: a scalar value or a buffer handle.
    RecordGetitem {
        /// Target record.
        record_id: RecordId,
        /// Variable name.
        key: String,
    },
    /// List a record's variable names.
    RecordKeys {
        /// Target record.
        record_id: RecordId,
    },
    /// Materialize the entries of a buffer surviving a slice.
    BufferlistSlice {
        /// Target record.
        record_id: RecordId,
        /// Variable name.
        key: String,
        /// Slice to apply; `None` fetches everything.
        slice: Option<SliceSpec>,
    },
    /// Filtered, paginated record listing.
    RecordQuery {
        /// App pattern (`*`-suffix wildcard) or all.
        app: Option<String>,
        /// Required tags.
        tags: Vec<String>,
        /// Rows to skip.
        offset: i64,
        /// Page size.
        limit: i64,
        /// Upper creation-time bound.
        before: Option<DateTime<Utc>>,
        /// Lower creation-time bound.
        after: Option<DateTime<Utc>>,
    },
    /// Remove a record: chunks, header and catalog row.
    RecordDelete {
        /// Target record.
        record_id: RecordId,
    },
    /// Submit a serialized scan recipe to the submission server.
    Submit {
        /// Serialized recipe (runner-defined encoding).
        recipe: Vec<u8>,
    },
    /// Look up the record id of a submitted scan.
    GetRecordId {
        /// The submitted scan.
        id: ScanId,
    },
}

/// One variable as returned by `record_getitem`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemReply {
    /// A scan-wide scalar.
    Scalar(Value),
    /// A buffer handle; entries travel via `bufferlist_slice`.
    Buffer(BufferHeader),
}

/// A reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    /// Liveness answer.
    Pong,
    /// Handler failed; the message is for logs, not for matching.
    Error(String),
    /// A freshly assigned record id.
    RecordId(RecordId),
    /// A serialized [`RecordDescription`].
    Description(Vec<u8>),
    /// One variable, or nothing for an unknown key.
    Item(Option<ItemReply>),
    /// Variable names.
    Keys(Vec<String>),
    /// Buffer entries surviving a slice.
    Entries(Vec<(Vec<usize>, Value)>),
    /// A record listing page.
    Query(RecordListing),
    /// The record id of a submitted scan, once known.
    SubmittedRecordId(Option<RecordId>),
    /// A submission acknowledgement.
    Submitted(ScanId),
    /// Operation completed with nothing to return.
    Empty,
}

/// Serialize any payload to its frame bytes.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    let mut buf = vec![];
    ciborium::into_writer(msg, &mut buf)?;
    Ok(Bytes::from(buf))
}

/// Deserialize a frame payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

/// Serialize a record description for the wire or the catalog.
pub fn encode_description(d: &RecordDescription) -> Result<Vec<u8>> {
    let mut buf = vec![];
    ciborium::into_writer(d, &mut buf)?;
    Ok(buf)
}

/// Deserialize a record description.
pub fn decode_description(bytes: &[u8]) -> Result<RecordDescription> {
    Ok(ciborium::from_reader(bytes)?)
}

/// Wrap a TCP stream in the length-delimited framing both sides use.
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_framed(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn request_roundtrip() {
        let mut variables = BTreeMap::new();
        variables.insert("x".to_string(), Value::Float(1.5));
        let req = Request::RecordAppend {
            record_id: RecordId::new(3),
            level: 1,
            step: 42,
            position: 7,
            variables,
        };
        let bytes = encode(&req).unwrap();
        let back: Request = decode(&bytes).unwrap();
        assert_matches!(back, Request::RecordAppend { record_id, level, step, position, variables } => {
            assert_eq!(record_id, RecordId::new(3));
            assert_eq!(level, 1);
            assert_eq!(step, 42);
            assert_eq!(position, 7);
            assert_eq!(variables["x"], Value::Float(1.5));
        });
    }

    #[test]
    fn request_is_a_method_tagged_map() {
        let bytes = encode(&Request::Ping).unwrap();
        let raw: ciborium::value::Value = ciborium::from_reader(&bytes[..]).unwrap();
        let map = raw.as_map().expect("request should be a map");
        let (k, v) = &map[0];
        assert_eq!(k.as_text(), Some("method"));
        assert_eq!(v.as_text(), Some("ping"));
    }

    #[test]
    fn description_roundtrip() {
        let mut d = RecordDescription::new("a.b");
        d.tags.push("t".into());
        let bytes = encode_description(&d).unwrap();
        assert_eq!(decode_description(&bytes).unwrap(), d);
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response::Item(Some(ItemReply::Buffer(BufferHeader {
            file: Some("aa/bb/cc/dd".into()),
            lu: vec![0],
            rd: vec![4],
            inner_shape: Some(vec![]),
        })));
        let bytes = encode(&resp).unwrap();
        let back: Response = decode(&bytes).unwrap();
        assert_matches!(back, Response::Item(Some(ItemReply::Buffer(h))) => {
            assert_eq!(h.rd, vec![4]);
        });
    }

    #[test]
    fn garbage_frame_is_a_decode_error() {
        let r: Result<Response> = decode(&[0xff, 0x00, 0x13]);
        assert_matches!(r, Err(Error::Decode(_)));
    }
}
