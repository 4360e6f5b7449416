//! `labscan record`: start the recorder daemon.

use std::path::PathBuf;

use observability_deps::tracing::info;
use recorder::{RecorderConfig, ServeOutcome};
use snafu::{ResultExt, Snafu};

use crate::config::FileConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("recorder failed: {source}"))]
    Serve { source: recorder::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub struct Config {
    /// Port the daemon serves on.
    #[clap(long, env = "LABSCAN_PORT")]
    port: Option<u16>,

    /// Data directory holding the catalog and the object tree.
    #[clap(long, env = "LABSCAN_DATAPATH")]
    datapath: Option<PathBuf>,

    /// Catalog database URL; defaults to SQLite inside the data directory.
    #[clap(long, env = "LABSCAN_DB_URL")]
    url: Option<String>,

    /// How long to wait for an existing daemon's pong before binding.
    #[clap(long, default_value = "1s")]
    timeout: humantime::Duration,
}

pub async fn command(config: Config, file: &FileConfig) -> Result<()> {
    let recorder_config = RecorderConfig {
        port: config
            .port
            .or(file.port)
            .unwrap_or(protocol::DEFAULT_PORT),
        datapath: config.datapath.unwrap_or_else(|| file.default_datapath()),
        db_url: config.url.or_else(|| file.db_url.clone()),
        ping_timeout: config.timeout.into(),
    };
    info!(?recorder_config, "starting recorder");

    match recorder::watch_or_serve(recorder_config)
        .await
        .context(ServeSnafu)?
    {
        ServeOutcome::AlreadyRunning => {
            info!("recorder already running; nothing to do");
            Ok(())
        }
        ServeOutcome::Served => Ok(()),
    }
}
