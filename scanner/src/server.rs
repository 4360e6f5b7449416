//! The scan submission server: holds running scans keyed by their scan
//! id and answers `submit` / `get_record_id` over the same wire framing
//! the recorder speaks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use protocol::{Request, Response};
use tokio::net::{TcpListener, TcpStream};

use crate::recipe::ScanRecipe;
use crate::{Result, ScanHandle};

/// Submission server configuration.
#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    /// TCP port to serve on.
    pub port: u16,
    /// Ping budget for the idempotent-start probe.
    pub ping_timeout: Duration,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            port: 6788,
            ping_timeout: Duration::from_secs(1),
        }
    }
}

/// What an idempotent start did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Another submission server already answers on the port.
    AlreadyRunning,
    /// This process served until the listener failed.
    Served,
}

type Pool = Arc<Mutex<HashMap<data_types::ScanId, ScanHandle>>>;

/// A bound, not yet running submission server.
#[derive(Debug)]
pub struct SubmissionServer {
    listener: TcpListener,
    pool: Pool,
}

impl SubmissionServer {
    /// Bind the port.
    pub async fn bind(config: &SubmissionConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        Ok(Self {
            listener,
            pool: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        println!("Server started");
        info!(addr = ?self.local_addr(), "submission server started");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            debug!(%peer, "client connected");
            tokio::spawn(connection(stream, Arc::clone(&self.pool)));
        }
    }
}

async fn connection(stream: TcpStream, pool: Pool) {
    let mut framed = protocol::framed(stream);
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "closing connection on frame error");
                break;
            }
        };
        let resp = match protocol::decode::<Request>(&frame) {
            Ok(req) => handle(&pool, req).await,
            Err(e) => Response::Error(format!("bad request: {e}")),
        };
        match protocol::encode(&resp) {
            Ok(bytes) => {
                if framed.send(bytes).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "unencodable response"),
        }
    }
}

async fn handle(pool: &Pool, req: Request) -> Response {
    match req {
        Request::Ping => Response::Pong,
        Request::Submit { recipe } => match protocol::decode::<ScanRecipe>(&recipe) {
            Ok(recipe) => {
                let scan = recipe.into_scan();
                let id = scan.id();
                let handle = scan.start();
                pool.lock().insert(id, handle);
                info!(%id, "scan submitted");
                Response::Submitted(id)
            }
            Err(e) => Response::Error(format!("bad recipe: {e}")),
        },
        Request::GetRecordId { id } => {
            // the scan may still be creating its record; poll briefly
            for _ in 0..10 {
                let record_id = pool.lock().get(&id).and_then(ScanHandle::try_record_id);
                if record_id.is_some() {
                    return Response::SubmittedRecordId(record_id);
                }
                if !pool.lock().contains_key(&id) {
                    return Response::Error(format!("no scan with id {id}"));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Response::SubmittedRecordId(None)
        }
        other => Response::Error(format!("method not served here: {other:?}")),
    }
}

/// Idempotent start: if a live server answers the port, report success
/// without binding.
pub async fn watch_or_serve(config: SubmissionConfig) -> Result<SubmissionOutcome> {
    let addr = format!("127.0.0.1:{}", config.port);
    if probe(&addr, config.ping_timeout).await {
        info!(%addr, "submission server already running, not binding");
        return Ok(SubmissionOutcome::AlreadyRunning);
    }
    let server = SubmissionServer::bind(&config)
        .await
        .map_err(|source| crate::Error::Bind {
            port: config.port,
            source,
        })?;
    server.run().await?;
    Ok(SubmissionOutcome::Served)
}

async fn probe(addr: &str, timeout: Duration) -> bool {
    let attempt = async {
        let stream = TcpStream::connect(addr).await.ok()?;
        let mut framed = protocol::framed(stream);
        framed.send(protocol::encode(&Request::Ping).ok()?).await.ok()?;
        let frame = framed.next().await?.ok()?;
        let resp: Response = protocol::decode(&frame).ok()?;
        matches!(resp, Response::Pong).then_some(())
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(())))
}
