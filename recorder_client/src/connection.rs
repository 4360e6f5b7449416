//! The async request/reply connection.

use std::time::Duration;

use data_types::{RecordDescription, RecordId, RecordListing};
use futures::{SinkExt, StreamExt};
use observability_deps::tracing::debug;
use protocol::{Request, Response};
use snafu::ResultExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    host_port, Backoff, BackoffConfig, ConnectSnafu, ConnectionClosedSnafu, PayloadSnafu,
    Result, ServerSnafu, SocketSnafu, TimeoutSnafu,
};

/// Reply budget for a liveness probe.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Reply budget for everything else.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// One framed socket to a recorder (or submission server). Strictly
/// request/reply except for appends, which expect no answer.
#[derive(Debug)]
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    timeout: Duration,
}

impl Connection {
    /// Connect to a `tcp://host:port` URL (the scheme is optional).
    pub async fn connect(url: &str) -> Result<Self> {
        let addr = host_port(url);
        let stream = TcpStream::connect(addr)
            .await
            .context(ConnectSnafu { addr })?;
        stream.set_nodelay(true).context(SocketSnafu)?;
        debug!(addr, "connected to recorder");
        Ok(Self {
            framed: protocol::framed(stream),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Connect with jittered-backoff retries.
    pub async fn connect_with_retries(
        url: &str,
        config: &BackoffConfig,
        attempts: usize,
    ) -> Result<Self> {
        Backoff::new(config)
            .retry("recorder connect", attempts, || Self::connect(url))
            .await
    }

    /// Override the reply budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request without waiting for any reply.
    pub async fn send(&mut self, req: &Request) -> Result<()> {
        let bytes = protocol::encode(req).context(PayloadSnafu)?;
        self.framed.send(bytes).await.context(SocketSnafu)
    }

    async fn recv(&mut self, budget: Duration) -> Result<Response> {
        let frame = tokio::time::timeout(budget, self.framed.next())
            .await
            .map_err(|_| {
                TimeoutSnafu {
                    millis: budget.as_millis(),
                }
                .build()
            })?
            .ok_or_else(|| ConnectionClosedSnafu.build())?
            .context(SocketSnafu)?;
        protocol::decode(&frame).context(PayloadSnafu)
    }

    /// One request/reply round trip; server errors become [`crate::Error::Server`].
    pub async fn request(&mut self, req: &Request) -> Result<Response> {
        let budget = match req {
            Request::Ping => PING_TIMEOUT,
            _ => self.timeout,
        };
        self.send(req).await?;
        match self.recv(budget).await? {
            Response::Error(message) => ServerSnafu { message }.fail(),
            resp => Ok(resp),
        }
    }

    /// Liveness probe.
    pub async fn ping(&mut self) -> Result<()> {
        match self.request(&Request::Ping).await? {
            Response::Pong => Ok(()),
            _ => crate::UnexpectedReplySnafu { method: "ping" }.fail(),
        }
    }

    /// Create a record, returning the assigned id.
    pub async fn record_create(&mut self, description: &RecordDescription) -> Result<RecordId> {
        let description = protocol::encode_description(description).context(PayloadSnafu)?;
        match self
            .request(&Request::RecordCreate { description })
            .await?
        {
            Response::RecordId(id) => Ok(id),
            _ => crate::UnexpectedReplySnafu {
                method: "record_create",
            }
            .fail(),
        }
    }

    /// Fire-and-forget append of one emission.
    pub async fn record_append(
        &mut self,
        id: RecordId,
        level: i64,
        step: u64,
        position: u64,
        variables: std::collections::BTreeMap<String, data_types::Value>,
    ) -> Result<()> {
        self.send(&Request::RecordAppend {
            record_id: id,
            level,
            step,
            position,
            variables,
        })
        .await
    }

    /// Fetch and decode a record's description.
    pub async fn record_description(&mut self, id: RecordId) -> Result<RecordDescription> {
        match self
            .request(&Request::RecordDescription { record_id: id })
            .await?
        {
            Response::Description(bytes) => {
                protocol::decode_description(&bytes).context(PayloadSnafu)
            }
            _ => crate::UnexpectedReplySnafu {
                method: "record_description",
            }
            .fail(),
        }
    }

    /// Filtered record listing.
    pub async fn record_query(
        &mut self,
        params: &record_catalog::QueryParams,
    ) -> Result<RecordListing> {
        let req = Request::RecordQuery {
            app: params.app.clone(),
            tags: params.tags.clone(),
            offset: params.offset,
            limit: params.limit,
            before: params.before,
            after: params.after,
        };
        match self.request(&req).await? {
            Response::Query(listing) => Ok(listing),
            _ => crate::UnexpectedReplySnafu {
                method: "record_query",
            }
            .fail(),
        }
    }
}
