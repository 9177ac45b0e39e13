#![warn(missing_docs)]

//! ClaudeFS cross-site replication server

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use claudefs_meta::config::MetaConfig;
use claudefs_meta::node::MetadataNode;
use claudefs_repl::applier::ServiceApplier;
use claudefs_repl::conduit::{Conduit, ConduitListener};
use claudefs_repl::config::ReplConfig;
use claudefs_repl::failover::{
    run_health_loop, FailoverManager, HealthCheck, LocalServiceCheck, SiteMode, TcpHealthCheck,
};
use claudefs_repl::{EventBus, ReplicationEngine};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cfs-repl")]
#[command(about = "ClaudeFS cross-site replication server", long_about = None)]
struct Args {
    /// Replication configuration file (.toml or .json)
    #[arg(short, long, default_value = "/etc/claudefs/repl.toml")]
    config: PathBuf,

    /// Metadata server configuration file (.toml or .json)
    #[arg(long, default_value = "/etc/claudefs/meta.toml")]
    meta_config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("ClaudeFS replication server starting...");

    let args = Args::parse();
    let config = ReplConfig::from_file(&args.config)?;
    let meta_config = MetaConfig::from_file(&args.meta_config)?;
    if meta_config.site_id != config.site_id {
        anyhow::bail!(
            "site mismatch: replication config has site {}, metadata config has site {}",
            config.site_id,
            meta_config.site_id
        );
    }

    let node = MetadataNode::start(meta_config).await?;
    let service = node.service().clone();

    let events = EventBus::default();
    let engine = ReplicationEngine::new(
        config.engine_config(),
        config.batch_key()?,
        Arc::new(ServiceApplier::new(service.clone())),
        events.clone(),
    );
    let failover = Arc::new(
        FailoverManager::new(config.failover.clone(), config.site_id, events.clone())
            .with_local_service(service.clone()),
    );
    failover
        .register_site(config.site_id, SiteMode::ActiveReadWrite)
        .await;

    let check_timeout = Duration::from_millis(config.failover.check_timeout_ms);
    let mut checks: Vec<Arc<dyn HealthCheck>> = vec![Arc::new(LocalServiceCheck::new(service.clone()))];
    let mut listener = ConduitListener::new();
    let mut conduits = Vec::new();
    for site in &config.sites {
        failover
            .register_site(site.site_id, SiteMode::ActiveReadWrite)
            .await;
        checks.push(Arc::new(TcpHealthCheck::new(site.site_id, site.addr.clone(), check_timeout)));
        let conduit: Arc<dyn Conduit> =
            Arc::new(listener.register(site.site_id, &site.addr, config.conduit_config()));
        conduits.push(conduit);
    }

    let (shutdown, shutdown_rx) = watch::channel(false);
    let tcp = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(site_id = config.site_id, addr = %tcp.local_addr()?, "replication listener bound");
    let serve_task = tokio::spawn(listener.serve(tcp, shutdown_rx.clone()));

    for conduit in conduits {
        engine.start_site(conduit, service.journal().clone()).await;
    }
    let health_task = tokio::spawn(run_health_loop(failover.clone(), checks, shutdown_rx));

    let mut event_rx = events.subscribe();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::info!(?event, "replication event");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    let _ = shutdown.send(true);
    engine.shutdown().await;
    let _ = health_task.await;
    match serve_task.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "replication listener exited with error"),
        Ok(Ok(())) | Err(_) => {}
    }
    event_task.abort();
    node.shutdown().await;
    Ok(())
}
