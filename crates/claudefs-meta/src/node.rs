//! Metadata server node: wires configuration, transport, shard groups and
//! the Raft listener into one running process.
//!
//! Both `cfs-meta` and `cfs-repl` host a `MetadataNode`; the replicator runs
//! next to it so it can tail the local journal and apply remote batches.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::MetaConfig;
use crate::kvstore::MemoryKvStore;
use crate::service::MetadataService;
use crate::shard::ShardAssigner;
use crate::transport::{TcpRaftTransport, TcpTransportConfig};
use crate::types::*;

/// A running metadata server.
pub struct MetadataNode {
    node_id: NodeId,
    service: Arc<MetadataService>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MetadataNode {
    /// Starts every shard this node replicates and begins serving Raft traffic.
    pub async fn start(config: MetaConfig) -> Result<Self, MetaError> {
        config
            .validate()
            .map_err(|e| MetaError::RaftError(e.to_string()))?;
        let node_id = NodeId::new(config.node_id);
        let transport = Arc::new(TcpRaftTransport::new(
            TcpTransportConfig::default(),
            config.peer_addrs(),
        ));
        let service = Arc::new(MetadataService::new(config.service_config(), transport));

        let assignments = ShardAssigner::distribute(
            config.num_shards,
            &config.cluster_nodes(),
            config.replication_factor,
        )?;
        for (shard_id, replicas) in assignments {
            if !replicas.contains(&node_id) {
                service.router().assign_shard(shard_id, replicas)?;
                continue;
            }
            let peers = replicas.into_iter().filter(|n| *n != node_id).collect();
            if let Err(e) = service.start_shard(shard_id, peers, Arc::new(MemoryKvStore::new())) {
                tracing::error!(node_id = %node_id, shard_id = %shard_id, error = %e, "shard failed to start");
            }
        }

        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(node_id = %node_id, addr = %local_addr, "raft listener bound");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(4096);
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move {
                if let Err(e) = TcpRaftTransport::serve(listener, inbound_tx, shutdown_rx).await {
                    tracing::warn!(error = %e, "raft listener exited with error");
                }
            }
        }));
        tasks.push(tokio::spawn(
            service.raft().clone().run_inbound(inbound_rx, shutdown_rx),
        ));

        let root_shard = service.router().route(InodeId::ROOT_INODE);
        if service.raft().shards().contains(&root_shard) {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                bootstrap_root(service, root_shard).await;
            }));
        }

        Ok(Self {
            node_id,
            service,
            local_addr,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The metadata service API.
    pub fn service(&self) -> &Arc<MetadataService> {
        &self.service
    }

    /// Address the Raft listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True while no hosted shard has halted.
    pub fn is_healthy(&self) -> bool {
        self.service.raft().halted_shards().is_empty()
    }

    /// Stops the listener and every shard group.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.service.shutdown().await;
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(node_id = %self.node_id, "metadata node stopped");
    }
}

async fn bootstrap_root(service: Arc<MetadataService>, root_shard: ShardId) {
    let group = match service.raft().group(root_shard) {
        Ok(group) => group,
        Err(e) => {
            tracing::error!(error = %e, "root shard unavailable");
            return;
        }
    };
    if group.wait_for_leader(Duration::from_secs(30)).await != Some(group.node_id()) {
        return;
    }
    match service.bootstrap_root().await {
        Ok(root) => tracing::info!(ino = %root.ino, "root directory ready"),
        Err(e) => tracing::warn!(error = %e, "root bootstrap deferred"),
    }
}
