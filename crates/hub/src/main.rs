//! Interactive controller: listens for agents and gives the operator a
//! prompt on the focused one.
//!
//! Usage: relay-hub [--host 0.0.0.0] [--port 5000] [--debug]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{self, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_hub::{run_controller, Acceptor, Args, Config, Registry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_args(args).context("invalid configuration")?;

    // Logs go to stderr; stdout belongs to the operator.
    let default_filter = if config.debug {
        "relay_hub=debug"
    } else {
        "relay_hub=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let registry = Arc::new(Registry::new());
    let acceptor = Acceptor::bind(&config, registry)
        .await
        .with_context(|| format!("failed to listen on {}", config.bind_addr()))?;
    info!(addr = %acceptor.local_addr()?, "relay-hub started");

    run_controller(acceptor, &config, BufReader::new(io::stdin()), io::stdout()).await?;
    Ok(())
}
