use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use chronocache::config;
use chronocache::logging;
use chronocache::server;

#[derive(Parser, Debug)]
#[command(name = "chronocache", about = "Delta-caching reverse proxy for time-series databases", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', default_value = "config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = config::load(&cli.config)?;
    logging::init(&cfg.logger, cli.verbose)?;
    cfg.validate()?;

    log::info!("chronocache starting with config {}", cli.config.display());
    server::run(Arc::new(cfg)).await
}
