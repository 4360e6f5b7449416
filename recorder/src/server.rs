//! The socket serve loop and the idempotent-startup handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use observability_deps::tracing::{debug, info, warn};
use protocol::{Request, Response};
use record_catalog::Catalog;
use snafu::ResultExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::handler::Recorder;
use crate::{BindSnafu, CatalogSnafu, IoSnafu, RecorderConfig, Result};

/// What an idempotent start did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// A live daemon already answers on the port; nothing was bound.
    AlreadyRunning,
    /// This process served until the listener failed.
    Served,
}

/// A bound, not yet running daemon.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    state: Arc<Recorder>,
}

impl Server {
    /// Open the catalog, prepare the object tree and bind the port.
    pub async fn bind(config: &RecorderConfig) -> Result<Self> {
        let objects = config.datapath.join("objects");
        std::fs::create_dir_all(&objects).context(IoSnafu { path: &objects })?;

        let catalog = match &config.db_url {
            Some(url) => Catalog::connect(url).await.context(CatalogSnafu)?,
            None => Catalog::open(&config.datapath).await.context(CatalogSnafu)?,
        };

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .context(BindSnafu { port: config.port })?;

        Ok(Self {
            listener,
            state: Arc::new(Recorder::new(catalog, config.datapath.clone())),
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        println!("Server started");
        info!(addr = ?self.local_addr(), "Server started");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%peer, "client connected");
            let state = Arc::clone(&self.state);
            tokio::spawn(connection(stream, state));
        }
    }
}

async fn connection(stream: TcpStream, state: Arc<Recorder>) {
    let framed = protocol::framed(stream);
    let (mut sink, mut source) = framed.split();

    // replies funnel through one writer task so concurrently handled
    // requests cannot interleave partial frames
    let (tx, mut rx) = mpsc::channel::<bytes::Bytes>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = source.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "closing connection on frame error");
                break;
            }
        };
        let req: Request = match protocol::decode(&frame) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "undecodable request");
                reply(&tx, Response::Error(format!("bad request: {e}"))).await;
                continue;
            }
        };
        match req {
            // appends are handled in the read loop itself: their arrival
            // order on this socket is the record's append order
            req @ Request::RecordAppend { .. } => {
                if let Some(resp) = state.handle(req).await {
                    reply(&tx, resp).await;
                }
            }
            req => {
                let state = Arc::clone(&state);
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(resp) = state.handle(req).await {
                        reply(&tx, resp).await;
                    }
                });
            }
        }
    }
    drop(tx);
    writer.await.ok();
}

async fn reply(tx: &mpsc::Sender<bytes::Bytes>, resp: Response) {
    match protocol::encode(&resp) {
        Ok(bytes) => {
            tx.send(bytes).await.ok();
        }
        Err(e) => warn!(error = %e, "unencodable response"),
    }
}

/// Probe `addr` for a live daemon: connect, send `ping`, expect `pong`,
/// all within `timeout`.
pub async fn ping(addr: &str, timeout: Duration) -> bool {
    let probe = async {
        let stream = TcpStream::connect(addr).await.ok()?;
        let mut framed = protocol::framed(stream);
        let bytes = protocol::encode(&Request::Ping).ok()?;
        framed.send(bytes).await.ok()?;
        let frame = framed.next().await?.ok()?;
        let resp: Response = protocol::decode(&frame).ok()?;
        matches!(resp, Response::Pong).then_some(())
    };
    matches!(tokio::time::timeout(timeout, probe).await, Ok(Some(())))
}

/// Idempotent start: answer-checking first, binding only when nobody
/// else serves the port. Two back-to-back launches leave exactly one
/// listener, the loser reporting success.
pub async fn watch_or_serve(config: RecorderConfig) -> Result<ServeOutcome> {
    let addr = format!("127.0.0.1:{}", config.port);
    if ping(&addr, config.ping_timeout).await {
        info!(%addr, "recorder already running, not binding");
        return Ok(ServeOutcome::AlreadyRunning);
    }
    let server = Server::bind(&config).await?;
    server.run().await?;
    Ok(ServeOutcome::Served)
}
