//! pyrepl - Persistent Python REPL Sessions
//!
//! CLI entry point.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod logging;
mod settings;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = settings::load_config()?;
    let _log_guard = logging::init(&config.logging);

    debug!("Starting pyrepl v{}", env!("CARGO_PKG_VERSION"));

    cli::run(cli, config).await
}
