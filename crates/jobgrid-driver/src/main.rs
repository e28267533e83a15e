use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use jobgrid_driver::{Driver, DriverConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// JobGrid driver
#[derive(Debug, Parser)]
#[command(name = "jg-driver", version, about)]
struct Args {
    /// Config file (.toml or .json)
    #[arg(short, long, env = "JOBGRID_DRIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Client listener, replaces the configured ones
    #[arg(long)]
    client_listen: Option<SocketAddr>,

    /// Node listener, replaces the configured ones
    #[arg(long)]
    node_listen: Option<SocketAddr>,

    /// Bundler algorithm
    #[arg(long)]
    bundler: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();
    }

    let mut config = match &args.config {
        Some(path) if path.exists() => DriverConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            DriverConfig::default()
        }
        None => DriverConfig::default(),
    };
    if let Some(addr) = args.client_listen {
        config.client_listen = vec![addr];
    }
    if let Some(addr) = args.node_listen {
        config.node_listen = vec![addr];
    }
    if let Some(algorithm) = args.bundler {
        config.bundler.algorithm = algorithm;
    }
    config.validate()?;

    let driver = Driver::start(config).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let stats = driver.stats();
    tracing::info!(stats = %serde_json::to_string(&stats)?, "final stats");
    driver.shutdown().await;
    Ok(())
}
