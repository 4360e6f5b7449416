//! Blocking one-shot requests over their own short-lived socket.
//!
//! Lazy remote buffers are consumed through the synchronous
//! [`buffer_list::EntrySource`] trait; each fetch opens a fresh blocking
//! connection, speaks one request/reply exchange in the same 4-byte
//! length-prefixed framing, and closes. This keeps reads usable from
//! non-async code and never touches the runtime's sockets.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use buffer_list::{Entry, EntrySource};
use data_types::{RecordId, SliceSpec};
use protocol::{Request, Response};

use crate::host_port;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One blocking request/reply exchange.
pub(crate) fn blocking_request(
    url: &str,
    req: &Request,
    timeout: Duration,
) -> Result<Response, BoxError> {
    let mut stream = TcpStream::connect(host_port(url))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.set_nodelay(true)?;

    let payload = protocol::encode(req)?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(&payload)?;

    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > protocol::MAX_FRAME_BYTES {
        return Err(format!("oversized reply frame: {len} bytes").into());
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(protocol::decode(&payload)?)
}

/// Entry source of a remote buffer: `(server, record, key)`.
#[derive(Debug, Clone)]
pub(crate) struct RemoteEntrySource {
    pub url: String,
    pub record_id: RecordId,
    pub key: String,
    pub timeout: Duration,
}

impl EntrySource for RemoteEntrySource {
    fn fetch(&self, slice: Option<&SliceSpec>) -> Result<Vec<Entry>, BoxError> {
        let req = Request::BufferlistSlice {
            record_id: self.record_id,
            key: self.key.clone(),
            slice: slice.cloned(),
        };
        match blocking_request(&self.url, &req, self.timeout)? {
            Response::Entries(entries) => Ok(entries),
            Response::Error(message) => Err(message.into()),
            other => Err(format!("unexpected reply: {other:?}").into()),
        }
    }
}
