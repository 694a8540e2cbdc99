use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use caprouter::config::resolve_config;
use caprouter::logging::init_tracing;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host (overrides config and CAPROUTER_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides config and CAPROUTER_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging for the router's own modules
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_path) = resolve_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.debug {
        config.log.filter = "caprouter=debug,info".into();
    }

    init_tracing(&config.log).context("failed to initialise logging")?;
    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "configuration loaded"),
        None => tracing::info!("no configuration file found, using defaults"),
    }

    caprouter::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    })
    .await?;

    Ok(())
}
