//! `labscan server`: start the scan submission server.

use observability_deps::tracing::info;
use scanner::server::{watch_or_serve, SubmissionConfig, SubmissionOutcome};
use snafu::{ResultExt, Snafu};

use crate::config::FileConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("submission server failed: {source}"))]
    Serve { source: scanner::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub struct Config {
    /// Port the submission server serves on.
    #[clap(long, env = "LABSCAN_SERVER_PORT")]
    port: Option<u16>,

    /// How long to wait for an existing server's pong before binding.
    #[clap(long, default_value = "1s")]
    timeout: humantime::Duration,
}

pub async fn command(config: Config, file: &FileConfig) -> Result<()> {
    let submission_config = SubmissionConfig {
        port: config.port.or(file.server_port).unwrap_or(6788),
        ping_timeout: config.timeout.into(),
    };
    info!(?submission_config, "starting submission server");

    match watch_or_serve(submission_config).await.context(ServeSnafu)? {
        SubmissionOutcome::AlreadyRunning => {
            info!("submission server already running; nothing to do");
            Ok(())
        }
        SubmissionOutcome::Served => Ok(()),
    }
}
