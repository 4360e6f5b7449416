//! Entrypoint for the `labscan` server binary.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clap::Parser;
use observability_deps::tracing::error;
use snafu::Snafu;

mod commands;
mod config;
mod logging;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Error in record subcommand: {source}"), context(false))]
    Record { source: commands::record::Error },

    #[snafu(display("Error in server subcommand: {source}"), context(false))]
    Server { source: commands::server::Error },
}

#[derive(Debug, Parser)]
#[clap(
    name = "labscan",
    about = "Scan orchestration and time-series storage for laboratory measurements",
    version
)]
struct Config {
    /// Log filter, e.g. `info` or `recorder=debug,info`.
    #[clap(long = "log-filter", env = "LOG_FILTER", global = true)]
    log_filter: Option<String>,

    /// Config file; defaults to `~/.labscan/config.toml`.
    #[clap(long = "config", env = "LABSCAN_CONFIG", global = true)]
    config_file: Option<std::path::PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Run the recorder daemon (idempotent: exits 0 when one is live)
    Record(commands::record::Config),

    /// Run the scan submission server
    Server(commands::server::Config),
}

fn main() {
    // load a `.env` if present, before clap reads the environment
    dotenvy::dotenv().ok();
    let config = Config::parse();
    let file = config::FileConfig::load(config.config_file.as_deref());

    let filter = config
        .log_filter
        .as_deref()
        .or(file.log_filter.as_deref())
        .unwrap_or("info");
    logging::init(filter);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime construction");

    let result: Result<(), Error> = runtime.block_on(async {
        match config.command {
            Command::Record(cmd) => Ok(commands::record::command(cmd, &file).await?),
            Command::Server(cmd) => Ok(commands::server::command(cmd, &file).await?),
        }
    });

    if let Err(e) = result {
        error!(error = %e, "command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
