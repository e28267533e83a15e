use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use jobgrid_node::{Node, NodeConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// JobGrid node
#[derive(Debug, Parser)]
#[command(name = "jg-node", version, about)]
struct Args {
    /// Config file (.toml or .json)
    #[arg(short, long, env = "JOBGRID_NODE_CONFIG")]
    config: Option<PathBuf>,

    /// Driver node listener
    #[arg(long)]
    driver: Option<SocketAddr>,

    /// Worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Nice value for worker threads
    #[arg(long, allow_negative_numbers = true)]
    priority: Option<i32>,

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
        Some(path) if path.exists() => NodeConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            NodeConfig::default()
        }
        None => NodeConfig::default(),
    };
    if let Some(driver) = args.driver {
        config.driver = driver;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(priority) = args.priority {
        config.priority = priority;
    }
    config.validate()?;

    let (handle, mut task) = Node::new(config)?.spawn();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutting down");
            handle.shutdown();
            (&mut task).await??;
        }
        result = &mut task => result??,
    }
    Ok(())
}
