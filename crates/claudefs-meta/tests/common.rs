//! Common test utilities and fixtures for integration tests.
//!
//! `SimCluster` drives real `RaftNode`s, log stores and state machines in
//! lockstep: no timers, no tasks, every message goes through the wire codec
//! and an in-process queue that honors partitions. Runs are deterministic for
//! a given seed.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use claudefs_meta::consensus::{RaftConfig, RaftNode};
use claudefs_meta::kvstore::{KvStore, MemoryKvStore};
use claudefs_meta::raft_log::{HardState, RaftLogStore};
use claudefs_meta::state_machine::{MetaStateMachine, StateMachineConfig};
use claudefs_meta::types::*;
use claudefs_meta::wire::WireFrame;

pub const SHARD: ShardId = ShardId::new(0);

/// One replica: consensus core, durable log and tables.
pub struct SimNode {
    pub raft: RaftNode,
    pub sm: MetaStateMachine,
    pub store: RaftLogStore,
    pub kv: Arc<dyn KvStore>,
    saved: HardState,
    /// Every entry this replica applied, in order.
    pub applied: Vec<LogEntry>,
}

/// Test configuration with sensible defaults for fast testing
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub nodes: u64,
    pub seed: u64,
    pub site_id: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            seed: 7,
            site_id: 1,
        }
    }
}

/// Represents an in-process cluster for testing
pub struct SimCluster {
    config: SimConfig,
    pub nodes: BTreeMap<NodeId, SimNode>,
    cut: HashSet<(NodeId, NodeId)>,
    queue: VecDeque<(NodeId, NodeId, bytes::Bytes)>,
}

fn raft_config(id: NodeId, all: &[NodeId], seed: u64) -> RaftConfig {
    RaftConfig {
        node_id: id,
        shard_id: SHARD,
        peers: all.iter().copied().filter(|p| *p != id).collect(),
        rng_seed: Some(seed.wrapping_mul(1_000).wrapping_add(id.as_u64())),
        ..RaftConfig::default()
    }
}

fn sm_config(site_id: u64) -> StateMachineConfig {
    StateMachineConfig {
        site_id,
        shard_id: SHARD,
        num_shards: 1,
    }
}

impl SimCluster {
    /// Create a new cluster with `config.nodes` replicas of one shard
    pub fn new(config: SimConfig) -> Self {
        let ids: Vec<NodeId> = (1..=config.nodes).map(NodeId::new).collect();
        let mut nodes = BTreeMap::new();
        for id in &ids {
            let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
            let node = SimNode {
                raft: RaftNode::new(raft_config(*id, &ids, config.seed)),
                sm: MetaStateMachine::open(kv.clone(), sm_config(config.site_id)).unwrap(),
                store: RaftLogStore::new(kv.clone(), SHARD),
                kv,
                saved: HardState::default(),
                applied: Vec::new(),
            };
            nodes.insert(*id, node);
        }
        Self {
            config,
            nodes,
            cut: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, id: NodeId) -> &SimNode {
        &self.nodes[&id]
    }

    /// Splits the cluster; nodes only reach members of their own group.
    pub fn partition(&mut self, groups: &[&[NodeId]]) {
        self.cut.clear();
        let ids = self.ids();
        let group_of = |n: NodeId| groups.iter().position(|g| g.contains(&n));
        for a in &ids {
            for b in &ids {
                if a != b && group_of(*a) != group_of(*b) {
                    self.cut.insert((*a, *b));
                }
            }
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    fn flush_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if let Some(snapshot) = node.raft.take_pending_snapshot() {
            node.sm.restore(&snapshot.data).unwrap();
            node.store.save_snapshot(&snapshot).unwrap();
            node.store
                .compact_through(snapshot.last_included_index)
                .unwrap();
        }
        if let Some(changes) = node.raft.take_unstable() {
            node.store.truncate_from(changes.truncate_from).unwrap();
            node.store.append_entries(&changes.entries).unwrap();
        }
        let hs = node.raft.hard_state();
        if hs != node.saved {
            node.store.save_hard_state(&hs).unwrap();
            node.saved = hs;
        }
        for (to, msg) in node.raft.take_messages() {
            let frame = WireFrame::new(SHARD, id, msg).encode().unwrap();
            self.queue.push_back((id, to, frame));
        }
        for entry in node.raft.take_committed_entries() {
            let outcome = node.sm.apply(&entry).unwrap();
            if outcome.status != claudefs_meta::ApplyStatus::AlreadyApplied {
                node.applied.push(entry);
            }
        }
    }

    /// Flushes every node and delivers messages until the network is quiet.
    pub fn settle(&mut self) {
        loop {
            for id in self.ids() {
                self.flush_node(id);
            }
            if self.queue.is_empty() {
                return;
            }
            while let Some((from, to, frame)) = self.queue.pop_front() {
                if self.cut.contains(&(from, to)) {
                    continue;
                }
                let frame = WireFrame::decode(&frame).unwrap();
                if let Some(node) = self.nodes.get_mut(&to) {
                    node.raft.step(frame.from, frame.message);
                }
            }
        }
    }

    /// Advances every node by one tick.
    pub fn tick(&mut self) {
        for node in self.nodes.values_mut() {
            node.raft.tick();
        }
        self.settle();
    }

    pub fn run_ticks(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Leaders, highest term first.
    pub fn leaders(&self) -> Vec<NodeId> {
        let mut leaders: Vec<(Term, NodeId)> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.raft.state() == RaftState::Leader)
            .map(|(id, n)| (n.raft.current_term(), *id))
            .collect();
        leaders.sort_by(|a, b| b.cmp(a));
        leaders.into_iter().map(|(_, id)| id).collect()
    }

    /// Ticks until some node among `candidates` leads with a term above `above`.
    pub fn elect_among(&mut self, candidates: &[NodeId], above: Term, max_ticks: usize) -> NodeId {
        for _ in 0..max_ticks {
            self.tick();
            for id in candidates {
                let raft = &self.nodes[id].raft;
                if raft.state() == RaftState::Leader && raft.current_term() > above {
                    return *id;
                }
            }
        }
        panic!("no leader among {:?} within {} ticks", candidates, max_ticks);
    }

    pub fn elect(&mut self) -> NodeId {
        let ids = self.ids();
        self.elect_among(&ids, Term::ZERO, 500)
    }

    pub fn propose(&mut self, id: NodeId, op: MetaOp) -> Result<LogIndex, MetaError> {
        let node = self.nodes.get_mut(&id).expect("unknown node");
        let result = node.raft.propose(op);
        self.settle();
        result
    }

    /// Rebuilds a node from its durable state, as after a crash.
    pub fn restart(&mut self, id: NodeId) {
        let ids = self.ids();
        let node = self.nodes.get_mut(&id).expect("unknown node");
        let recovered = node.store.recover().unwrap();
        node.sm = MetaStateMachine::open(node.kv.clone(), sm_config(self.config.site_id)).unwrap();
        node.saved = recovered.hard_state;
        node.raft = RaftNode::restore(
            raft_config(id, &ids, self.config.seed),
            recovered,
            node.sm.last_applied(),
        );
    }

    /// `(index, term)` pairs each node applied.
    pub fn applied_positions(&self, id: NodeId) -> Vec<(LogIndex, Term)> {
        self.nodes[&id]
            .applied
            .iter()
            .map(|e| (e.index, e.term))
            .collect()
    }

    pub fn fingerprint(&self, id: NodeId) -> [u8; 32] {
        self.nodes[&id].sm.fingerprint().unwrap()
    }
}

pub fn root_op() -> MetaOp {
    MetaOp::CreateInode {
        attr: InodeAttr::new_directory(InodeId::ROOT_INODE, 0, 0, 0o755),
    }
}

pub fn create_file_op(ino: u64, name: &str) -> MetaOp {
    let mut attr = InodeAttr::new_file(InodeId::new(ino), 0, 0, 0o644);
    // fixed timestamps keep fingerprints comparable across runs
    attr.atime = Timestamp::new(1, 0);
    attr.mtime = Timestamp::new(1, 0);
    attr.ctime = Timestamp::new(1, 0);
    attr.crtime = Timestamp::new(1, 0);
    MetaOp::Transaction {
        ops: vec![
            MetaOp::CreateInode { attr },
            MetaOp::CreateEntry {
                parent: InodeId::ROOT_INODE,
                name: name.to_string(),
                entry: DirEntry {
                    name: name.to_string(),
                    ino: InodeId::new(ino),
                    file_type: FileType::RegularFile,
                },
            },
        ],
    }
}
