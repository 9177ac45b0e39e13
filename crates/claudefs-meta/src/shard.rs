//! Shard routing for distributed metadata.
//!
//! Maps inodes and paths to shards, and shards to their replicas and last
//! known leader. The router only holds keyed leadership metadata; the groups
//! themselves are owned by [`crate::multiraft::MultiRaftManager`].

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;

use crate::types::*;

/// Information about a single virtual shard.
#[derive(Clone, Debug)]
pub struct ShardInfo {
    /// The unique identifier for this shard.
    pub shard_id: ShardId,
    /// The Raft group members (replica nodes) for this shard.
    pub replicas: Vec<NodeId>,
    /// The current Raft leader for this shard (None between elections).
    pub leader: Option<NodeId>,
    /// Highest term any leadership report carried.
    pub leader_term: Term,
}

impl ShardInfo {
    fn new(shard_id: ShardId, replicas: Vec<NodeId>) -> Self {
        Self {
            shard_id,
            replicas,
            leader: None,
            leader_term: Term::ZERO,
        }
    }
}

/// Routes inodes to shards and shards to nodes.
pub struct ShardRouter {
    num_shards: u16,
    shards: DashMap<ShardId, ShardInfo>,
}

impl ShardRouter {
    /// Creates a new router with the given number of shards.
    pub fn new(num_shards: u16) -> Self {
        Self {
            num_shards: num_shards.max(1),
            shards: DashMap::new(),
        }
    }

    /// Number of shards in the cluster.
    pub fn num_shards(&self) -> u16 {
        self.num_shards
    }

    /// Returns the shard that owns the given inode.
    pub fn route(&self, ino: InodeId) -> ShardId {
        ino.shard(self.num_shards)
    }

    /// Shard derived from a path, for placement decisions keyed by name.
    pub fn route_path(&self, path: &str) -> ShardId {
        let normalized = normalize_path(path);
        let digest = blake3::hash(normalized.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        ShardId::new((u64::from_le_bytes(word) % self.num_shards as u64) as u16)
    }

    /// Last known leader of a shard; `None` while it is between elections.
    pub fn leader_of(&self, shard_id: ShardId) -> Option<NodeId> {
        self.shards.get(&shard_id).and_then(|info| info.leader)
    }

    /// Leader of the shard owning `ino`, or `NotLeader` without a hint.
    pub fn leader_for_inode(&self, ino: InodeId) -> Result<NodeId, MetaError> {
        self.leader_of(self.route(ino))
            .ok_or(MetaError::NotLeader { leader_hint: None })
    }

    /// Records a leader observed at `term`. Reports older than the known term are ignored.
    pub fn observe_leader(&self, shard_id: ShardId, leader: NodeId, term: Term) {
        let mut info = self
            .shards
            .entry(shard_id)
            .or_insert_with(|| ShardInfo::new(shard_id, Vec::new()));
        if term < info.leader_term {
            return;
        }
        if info.leader != Some(leader) || info.leader_term != term {
            tracing::debug!(
                shard_id = %shard_id,
                leader = %leader,
                term = %term,
                "shard leader observed"
            );
        }
        info.leader = Some(leader);
        info.leader_term = term;
    }

    /// Forgets the leader after a group observed `term` without one.
    pub fn clear_leader(&self, shard_id: ShardId, term: Term) {
        if let Some(mut info) = self.shards.get_mut(&shard_id) {
            if term < info.leader_term {
                return;
            }
            info.leader = None;
            info.leader_term = term;
        }
    }

    /// Assigns a shard to a set of replica nodes.
    pub fn assign_shard(&self, shard_id: ShardId, replicas: Vec<NodeId>) -> Result<(), MetaError> {
        if replicas.is_empty() {
            return Err(MetaError::RaftError(
                "shard must have at least one replica".to_string(),
            ));
        }
        let mut info = self
            .shards
            .entry(shard_id)
            .or_insert_with(|| ShardInfo::new(shard_id, Vec::new()));
        if info.leader.is_some_and(|l| !replicas.contains(&l)) {
            info.leader = None;
        }
        info.replicas = replicas;
        Ok(())
    }

    /// All replica nodes of a shard.
    pub fn replicas_of(&self, shard_id: ShardId) -> Result<Vec<NodeId>, MetaError> {
        self.shards
            .get(&shard_id)
            .filter(|info| !info.replicas.is_empty())
            .map(|info| info.replicas.clone())
            .ok_or(MetaError::ShardNotFound(shard_id))
    }

    /// All shards hosted on the given node, in id order.
    pub fn shards_on_node(&self, node_id: NodeId) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .shards
            .iter()
            .filter(|info| info.replicas.contains(&node_id))
            .map(|info| info.shard_id)
            .collect();
        shards.sort();
        shards
    }

    /// Removes a node from every shard; returns the shards left without replicas.
    pub fn remove_node(&self, node_id: NodeId) -> Vec<ShardId> {
        let mut orphaned = Vec::new();
        for mut info in self.shards.iter_mut() {
            if !info.replicas.contains(&node_id) {
                continue;
            }
            info.replicas.retain(|n| *n != node_id);
            if info.leader == Some(node_id) {
                info.leader = None;
            }
            if info.replicas.is_empty() {
                orphaned.push(info.shard_id);
            }
        }
        tracing::debug!(
            node_id = %node_id,
            orphaned = orphaned.len(),
            "removed node from shard map"
        );
        orphaned.sort();
        orphaned
    }

    /// Snapshot of every known shard.
    pub fn all_shards(&self) -> Vec<ShardInfo> {
        let mut all: Vec<ShardInfo> = self.shards.iter().map(|i| i.clone()).collect();
        all.sort_by_key(|i| i.shard_id);
        all
    }
}

fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

/// Distributes shards across nodes for the metadata cluster.
pub struct ShardAssigner;

impl ShardAssigner {
    /// Places `replication_factor` replicas of each shard on distinct nodes.
    ///
    /// Replicas rotate through the node list, so every node carries
    /// `num_shards * replication_factor / nodes.len()` replicas (give or take one).
    pub fn distribute(
        num_shards: u16,
        nodes: &[NodeId],
        replication_factor: usize,
    ) -> Result<Vec<(ShardId, Vec<NodeId>)>, MetaError> {
        if nodes.is_empty() {
            return Err(MetaError::RaftError(
                "no nodes available for shard distribution".to_string(),
            ));
        }
        if replication_factor == 0 {
            return Err(MetaError::RaftError(
                "replication factor must be greater than 0".to_string(),
            ));
        }
        if nodes.len() < replication_factor {
            return Err(MetaError::RaftError(format!(
                "not enough nodes ({}) for replication factor {}",
                nodes.len(),
                replication_factor
            )));
        }

        let assignments: Vec<(ShardId, Vec<NodeId>)> = (0..num_shards)
            .map(|shard| {
                let replicas = (0..replication_factor)
                    .map(|k| nodes[(shard as usize + k) % nodes.len()])
                    .collect();
                (ShardId::new(shard), replicas)
            })
            .collect();

        tracing::debug!(
            num_shards,
            nodes = nodes.len(),
            replication_factor,
            "distributed shards"
        );
        Ok(assignments)
    }
}

/// Exponential backoff for callers that hit `NotLeader` or `QuorumUnavailable`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempts before giving up, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, MetaError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MetaError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
