//! Multi-Raft group manager for distributed metadata.
//!
//! Hosts one [`ShardGroup`] per shard replicated on this node and demultiplexes
//! inbound wire frames to them by shard id. Groups are fully independent: a
//! halted or partitioned shard never blocks the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::group::{ApplyObserver, GroupConfig, GroupStatus, ShardGroup};
use crate::kvstore::KvStore;
use crate::shard::ShardRouter;
use crate::state_machine::{ApplyOutcome, MetaStateMachine};
use crate::transport::RaftTransport;
use crate::types::*;
use crate::wire::WireFrame;

/// Manages multiple Raft groups, one per shard on this node.
pub struct MultiRaftManager {
    node_id: NodeId,
    router: Arc<ShardRouter>,
    transport: Arc<dyn RaftTransport>,
    observers: Vec<Arc<dyn ApplyObserver>>,
    groups: RwLock<HashMap<ShardId, Arc<ShardGroup>>>,
    halted: RwLock<HashSet<ShardId>>,
}

impl MultiRaftManager {
    /// Create a new Multi-Raft manager for this node.
    ///
    /// `observers` are attached to every group started through this manager.
    pub fn new(
        node_id: NodeId,
        router: Arc<ShardRouter>,
        transport: Arc<dyn RaftTransport>,
        observers: Vec<Arc<dyn ApplyObserver>>,
    ) -> Self {
        Self {
            node_id,
            router,
            transport,
            observers,
            groups: RwLock::new(HashMap::new()),
            halted: RwLock::new(HashSet::new()),
        }
    }

    /// This node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The shard router shared by all groups.
    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// Recovers and starts the group for `config.raft.shard_id`.
    ///
    /// A shard whose durable log fails recovery is recorded as halted and
    /// keeps answering `ShardHalted` until restarted.
    pub fn start_group(&self, config: GroupConfig, kv: Arc<dyn KvStore>) -> Result<(), MetaError> {
        let shard_id = config.raft.shard_id;
        if self.read_groups()?.contains_key(&shard_id) {
            return Err(MetaError::RaftError(format!(
                "group for shard {} already running",
                shard_id
            )));
        }

        let group = match ShardGroup::start(
            config,
            kv,
            self.transport.clone(),
            self.router.clone(),
            self.observers.clone(),
        ) {
            Ok(group) => group,
            Err(e @ MetaError::LogCorrupted { .. }) => {
                tracing::error!(
                    node_id = %self.node_id,
                    shard_id = %shard_id,
                    error = %e,
                    "refusing to start shard with corrupted log"
                );
                self.mark_halted(shard_id)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.write_groups()?.insert(shard_id, Arc::new(group));
        self.halted
            .write()
            .map_err(|e| MetaError::RaftError(format!("failed to acquire write lock: {}", e)))?
            .remove(&shard_id);
        tracing::debug!(
            node_id = %self.node_id,
            shard_id = %shard_id,
            "initialized Raft group for shard"
        );
        Ok(())
    }

    fn mark_halted(&self, shard_id: ShardId) -> Result<(), MetaError> {
        self.halted
            .write()
            .map_err(|e| MetaError::RaftError(format!("failed to acquire write lock: {}", e)))?
            .insert(shard_id);
        Ok(())
    }

    fn read_groups(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ShardId, Arc<ShardGroup>>>, MetaError> {
        self.groups
            .read()
            .map_err(|e| MetaError::RaftError(format!("failed to acquire read lock: {}", e)))
    }

    fn write_groups(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ShardId, Arc<ShardGroup>>>, MetaError> {
        self.groups
            .write()
            .map_err(|e| MetaError::RaftError(format!("failed to acquire write lock: {}", e)))
    }

    fn is_halted(&self, shard_id: ShardId) -> bool {
        self.halted
            .read()
            .map(|h| h.contains(&shard_id))
            .unwrap_or(false)
    }

    /// The running group for a shard.
    pub fn group(&self, shard_id: ShardId) -> Result<Arc<ShardGroup>, MetaError> {
        if self.is_halted(shard_id) {
            return Err(MetaError::ShardHalted(shard_id));
        }
        self.read_groups()?
            .get(&shard_id)
            .cloned()
            .ok_or(MetaError::ShardNotFound(shard_id))
    }

    /// Routes one encoded frame to its shard's group.
    pub fn dispatch(&self, frame: &[u8]) -> Result<(), MetaError> {
        let frame = WireFrame::decode(frame)?;
        let group = self.group(frame.shard_id)?;
        group.deliver(frame.from, frame.message);
        Ok(())
    }

    /// Feeds frames from `inbound` to the groups until shutdown.
    pub async fn run_inbound(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(e) = self.dispatch(&frame) {
                        tracing::debug!(node_id = %self.node_id, error = %e, "dropping inbound frame");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Proposes an operation to a shard's group and waits for it to apply.
    pub async fn propose(&self, shard_id: ShardId, op: MetaOp) -> Result<ApplyOutcome, MetaError> {
        let group = self.group(shard_id)?;
        group.propose(op).await
    }

    /// Read access to a shard's tables.
    pub fn state_machine(&self, shard_id: ShardId) -> Result<Arc<MetaStateMachine>, MetaError> {
        Ok(self.group(shard_id)?.state_machine().clone())
    }

    /// Status of one shard's group.
    pub fn status(&self, shard_id: ShardId) -> Result<GroupStatus, MetaError> {
        Ok(self.group(shard_id)?.status())
    }

    /// Returns true if this node currently leads `shard_id`.
    pub fn is_leader(&self, shard_id: ShardId) -> bool {
        self.status(shard_id)
            .map(|s| s.state == RaftState::Leader)
            .unwrap_or(false)
    }

    /// Shards hosted here, ascending.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .read_groups()
            .map(|g| g.keys().copied().collect())
            .unwrap_or_default();
        shards.sort();
        shards
    }

    /// Shards that stopped after detecting corruption, ascending.
    pub fn halted_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .halted
            .read()
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default();
        if let Ok(groups) = self.read_groups() {
            for (shard, group) in groups.iter() {
                if group.status().halted && !shards.contains(shard) {
                    shards.push(*shard);
                }
            }
        }
        shards.sort();
        shards
    }

    /// Stops every group.
    pub async fn shutdown(&self) {
        let groups: Vec<Arc<ShardGroup>> = match self.write_groups() {
            Ok(mut groups) => groups.drain().map(|(_, g)| g).collect(),
            Err(_) => Vec::new(),
        };
        for group in groups {
            group.stop().await;
        }
    }
}
