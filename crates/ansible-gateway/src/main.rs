//! `ansible-gateway` binary: load config, install tracing, run the
//! daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ansible_gateway::runtime::LoggingRuntime;
use ansible_gateway::{Daemon, GatewayConfig};

/// Gateway daemon for the ansible coordination plane.
#[derive(Debug, Parser)]
#[command(name = "ansible-gateway", version, about)]
struct Cli {
    /// Path to the gateway config file.
    #[arg(long, default_value = "ansible.toml")]
    config: PathBuf,

    /// Verbose (debug-level) logging.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let daemon = Daemon::start(config, Arc::new(LoggingRuntime))
        .await
        .context("starting gateway")?;
    daemon.run().await;
    Ok(())
}
