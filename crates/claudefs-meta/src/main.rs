#![warn(missing_docs)]

//! ClaudeFS metadata server

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use claudefs_meta::config::MetaConfig;
use claudefs_meta::node::MetadataNode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cfs-meta")]
#[command(about = "ClaudeFS metadata server", long_about = None)]
struct Args {
    /// Configuration file (.toml or .json)
    #[arg(short, long, default_value = "/etc/claudefs/meta.toml")]
    config: PathBuf,

    /// Override the configured node id
    #[arg(long)]
    node_id: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("ClaudeFS metadata server starting...");

    let args = Args::parse();
    let mut config = if args.config.exists() {
        MetaConfig::from_file(&args.config)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", args.config.display());
        MetaConfig {
            replication_factor: 1,
            ..MetaConfig::default()
        }
    };
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    config.validate()?;

    let node = MetadataNode::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    node.shutdown().await;
    Ok(())
}
