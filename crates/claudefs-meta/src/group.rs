//! One shard's consensus group as a tokio task.
//!
//! The task exclusively owns the shard's [`RaftNode`], its durable log and
//! the write side of its state machine. Everything else talks to it through
//! bounded channels: proposals (each with a oneshot reply), inbound Raft
//! messages, a shutdown signal, plus a status watch and a broadcast of
//! applied entries going out.
//!
//! Each loop iteration persists log changes and the hard state before any
//! message leaves the node, then applies newly committed entries in order,
//! notifies the observers (coherence coordinator, journal) and only then
//! answers the proposer.
//!
//! A new leader validates nothing until it has applied its own term's first
//! entry; proposals arriving earlier wait in a queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::consensus::{RaftConfig, RaftNode};
use crate::kvstore::KvStore;
use crate::raft_log::{HardState, RaftLogStore};
use crate::shard::ShardRouter;
use crate::snapshot::{RaftSnapshot, SnapshotPolicy};
use crate::state_machine::{ApplyOutcome, ApplyStatus, MetaStateMachine, StateMachineConfig};
use crate::transport::RaftTransport;
use crate::types::*;
use crate::wire::WireFrame;

/// Receives every entry the state machine applied, inside the apply path.
pub trait ApplyObserver: Send + Sync {
    /// Called once per applied or rejected entry, before the proposer is answered.
    fn on_applied(&self, shard_id: ShardId, entry: &LogEntry, outcome: &ApplyOutcome);
}

/// Settings for one shard group.
#[derive(Clone, Debug)]
pub struct GroupConfig {
    /// Raft parameters, including this node and its peers.
    pub raft: RaftConfig,
    /// State machine identity.
    pub state_machine: StateMachineConfig,
    /// Wall-clock length of one Raft tick.
    pub tick_interval: Duration,
    /// How long a proposer waits for its entry to apply.
    pub proposal_timeout: Duration,
    /// When to snapshot and how much log to keep.
    pub snapshot: SnapshotPolicy,
    /// Capacity of the proposal and inbound queues.
    pub channel_capacity: usize,
}

impl GroupConfig {
    /// Defaults for `node_id` serving `shard_id` together with `peers`.
    pub fn new(node_id: NodeId, shard_id: ShardId, peers: Vec<NodeId>, site_id: u64, num_shards: u16) -> Self {
        Self {
            raft: RaftConfig {
                node_id,
                shard_id,
                peers,
                ..RaftConfig::default()
            },
            state_machine: StateMachineConfig {
                site_id,
                shard_id,
                num_shards,
            },
            tick_interval: Duration::from_millis(10),
            proposal_timeout: Duration::from_secs(5),
            snapshot: SnapshotPolicy::default(),
            channel_capacity: 1024,
        }
    }
}

/// Point-in-time view of a group, published on every change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupStatus {
    /// Shard served
    pub shard_id: ShardId,
    /// Local node
    pub node_id: NodeId,
    /// Local role
    pub state: RaftState,
    /// Current term
    pub term: Term,
    /// Known leader
    pub leader: Option<NodeId>,
    /// Highest committed index
    pub commit_index: LogIndex,
    /// Highest applied index
    pub last_applied: LogIndex,
    /// Leader has lost its quorum; writes are refused
    pub quorum_lost: bool,
    /// The group stopped after detecting corruption
    pub halted: bool,
}

struct Proposal {
    op: MetaOp,
    reply: oneshot::Sender<Result<ApplyOutcome, MetaError>>,
}

struct Pending {
    term: Term,
    deadline: Instant,
    reply: oneshot::Sender<Result<ApplyOutcome, MetaError>>,
}

/// Handle to a running shard group.
pub struct ShardGroup {
    shard_id: ShardId,
    node_id: NodeId,
    proposals: mpsc::Sender<Proposal>,
    inbound: mpsc::Sender<(NodeId, RaftMessage)>,
    status: watch::Receiver<GroupStatus>,
    applied: broadcast::Sender<ApplyOutcome>,
    state_machine: Arc<MetaStateMachine>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ShardGroup {
    /// Recovers the shard from `kv` and spawns its task.
    ///
    /// Fails with `LogCorrupted` if the stored log does not pass recovery
    /// checks; the shard then stays down until an operator repairs it.
    pub fn start(
        config: GroupConfig,
        kv: Arc<dyn KvStore>,
        transport: Arc<dyn RaftTransport>,
        router: Arc<ShardRouter>,
        observers: Vec<Arc<dyn ApplyObserver>>,
    ) -> Result<Self, MetaError> {
        let shard_id = config.raft.shard_id;
        let node_id = config.raft.node_id;

        let store = RaftLogStore::new(kv.clone(), shard_id);
        let recovered = store.recover()?;
        let state_machine = Arc::new(MetaStateMachine::open(kv, config.state_machine.clone())?);
        let mut snapshot_index = LogIndex::ZERO;
        if let Some(snapshot) = &recovered.snapshot {
            snapshot_index = snapshot.last_included_index;
            if state_machine.last_applied() < snapshot.last_included_index {
                state_machine.restore(&snapshot.data)?;
            }
        }
        let saved_hard_state = recovered.hard_state;
        let node = RaftNode::restore(config.raft.clone(), recovered, state_machine.last_applied());

        let (proposal_tx, proposal_rx) = mpsc::channel(config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (applied_tx, _) = broadcast::channel(config.channel_capacity);
        let initial = GroupStatus {
            shard_id,
            node_id,
            state: node.state(),
            term: node.current_term(),
            leader: node.leader_id(),
            commit_index: node.commit_index(),
            last_applied: node.last_applied(),
            quorum_lost: false,
            halted: false,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let task = GroupTask {
            node,
            state_machine: state_machine.clone(),
            store,
            transport,
            router,
            observers,
            pending: BTreeMap::new(),
            deferred: VecDeque::new(),
            saved_hard_state,
            snapshot_index,
            last_leader: (None, Term::ZERO),
            status: status_tx,
            applied: applied_tx.clone(),
            config,
        };
        let handle = tokio::spawn(task.run(proposal_rx, inbound_rx, shutdown_rx));

        tracing::info!(node_id = %node_id, shard_id = %shard_id, "shard group started");
        Ok(Self {
            shard_id,
            node_id,
            proposals: proposal_tx,
            inbound: inbound_tx,
            status: status_rx,
            applied: applied_tx,
            state_machine,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(handle)),
        })
    }

    /// Shard served by this group.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Local node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Proposes an operation and waits until it is applied.
    ///
    /// Dropping the returned future stops the wait; the entry may still commit.
    pub async fn propose(&self, op: MetaOp) -> Result<ApplyOutcome, MetaError> {
        let (reply, rx) = oneshot::channel();
        self.proposals
            .send(Proposal { op, reply })
            .await
            .map_err(|_| MetaError::ShardHalted(self.shard_id))?;
        rx.await.map_err(|_| MetaError::ShardHalted(self.shard_id))?
    }

    /// Queues a message from a peer. Dropped when the queue is full.
    pub fn deliver(&self, from: NodeId, msg: RaftMessage) {
        if let Err(e) = self.inbound.try_send((from, msg)) {
            tracing::debug!(
                node_id = %self.node_id,
                shard_id = %self.shard_id,
                from = %from,
                error = %e,
                "dropping inbound raft message"
            );
        }
    }

    /// Latest status.
    pub fn status(&self) -> GroupStatus {
        self.status.borrow().clone()
    }

    /// Watch for status changes.
    pub fn watch_status(&self) -> watch::Receiver<GroupStatus> {
        self.status.clone()
    }

    /// Stream of applied entries.
    pub fn subscribe_applied(&self) -> broadcast::Receiver<ApplyOutcome> {
        self.applied.subscribe()
    }

    /// Read access to the shard's tables.
    pub fn state_machine(&self) -> &Arc<MetaStateMachine> {
        &self.state_machine
    }

    /// Waits until the group reports a leader, or `timeout` elapses.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let mut status = self.status.clone();
        let wait = status.wait_for(|s| s.leader.is_some() || s.halted);
        let leader = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(s)) => s.leader,
            _ => None,
        };
        leader
    }

    /// Stops the task and waits for it to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(node_id = %self.node_id, shard_id = %self.shard_id, "shard group stopped");
    }
}

struct GroupTask {
    node: RaftNode,
    state_machine: Arc<MetaStateMachine>,
    store: RaftLogStore,
    transport: Arc<dyn RaftTransport>,
    router: Arc<ShardRouter>,
    observers: Vec<Arc<dyn ApplyObserver>>,
    pending: BTreeMap<LogIndex, Pending>,
    deferred: VecDeque<(Instant, Proposal)>,
    saved_hard_state: HardState,
    snapshot_index: LogIndex,
    last_leader: (Option<NodeId>, Term),
    status: watch::Sender<GroupStatus>,
    applied: broadcast::Sender<ApplyOutcome>,
    config: GroupConfig,
}

impl GroupTask {
    fn shard_id(&self) -> ShardId {
        self.config.raft.shard_id
    }

    async fn run(
        mut self,
        mut proposals: mpsc::Receiver<Proposal>,
        mut inbound: mpsc::Receiver<(NodeId, RaftMessage)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.node.tick();
                    self.expire_proposals();
                }
                Some((from, msg)) = inbound.recv() => self.node.step(from, msg),
                Some(proposal) = proposals.recv() => self.handle_proposal(proposal),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            self.serve_deferred();
            if let Err(e) = self.on_ready().await {
                self.halt(e);
                Self::serve_halted(self.shard_id(), proposals, shutdown).await;
                return;
            }
        }
        let shard_id = self.shard_id();
        self.fail_pending(|| MetaError::ShardHalted(shard_id));
    }

    fn handle_proposal(&mut self, proposal: Proposal) {
        if self.node.state() != RaftState::Leader {
            let _ = proposal.reply.send(Err(MetaError::NotLeader {
                leader_hint: self.node.leader_id(),
            }));
            return;
        }
        if self.state_machine.last_applied() < self.node.term_start_index() {
            let deadline = Instant::now() + self.config.proposal_timeout;
            self.deferred.push_back((deadline, proposal));
            return;
        }
        if let Err(e) = self.state_machine.validate(&proposal.op) {
            let _ = proposal.reply.send(Err(e));
            return;
        }
        match self.node.propose(proposal.op) {
            Ok(index) => {
                self.pending.insert(
                    index,
                    Pending {
                        term: self.node.current_term(),
                        deadline: Instant::now() + self.config.proposal_timeout,
                        reply: proposal.reply,
                    },
                );
            }
            Err(e) => {
                let _ = proposal.reply.send(Err(e));
            }
        }
    }

    /// Releases queued proposals once the leader caught up with its term.
    fn serve_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        if self.node.state() != RaftState::Leader {
            let leader_hint = self.node.leader_id();
            for (_, p) in self.deferred.drain(..) {
                let _ = p.reply.send(Err(MetaError::NotLeader { leader_hint }));
            }
            return;
        }
        if self.state_machine.last_applied() < self.node.term_start_index() {
            return;
        }
        tracing::debug!(
            shard_id = %self.shard_id(),
            queued = self.deferred.len(),
            "leader caught up with its term, serving queued proposals"
        );
        for (_, proposal) in std::mem::take(&mut self.deferred) {
            self.handle_proposal(proposal);
        }
    }

    fn expire_proposals(&mut self) {
        let now = Instant::now();
        while self.deferred.front().is_some_and(|(deadline, _)| *deadline <= now) {
            if let Some((_, p)) = self.deferred.pop_front() {
                let _ = p.reply.send(Err(MetaError::ProposalTimeout));
            }
        }
        let expired: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(i, _)| *i)
            .collect();
        for index in expired {
            if let Some(p) = self.pending.remove(&index) {
                let err = if self.node.is_quorum_lost() {
                    MetaError::QuorumUnavailable {
                        shard: self.shard_id(),
                    }
                } else {
                    MetaError::ProposalTimeout
                };
                let _ = p.reply.send(Err(err));
            }
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> MetaError) {
        for (_, p) in std::mem::take(&mut self.pending) {
            let _ = p.reply.send(Err(err()));
        }
        for (_, p) in self.deferred.drain(..) {
            let _ = p.reply.send(Err(err()));
        }
    }

    async fn on_ready(&mut self) -> Result<(), MetaError> {
        if let Some(snapshot) = self.node.take_pending_snapshot() {
            self.install_snapshot(snapshot)?;
        }

        if let Some(changes) = self.node.take_unstable() {
            self.store.truncate_from(changes.truncate_from)?;
            self.store.append_entries(&changes.entries)?;
        }
        let hard_state = self.node.hard_state();
        if hard_state != self.saved_hard_state {
            self.store.save_hard_state(&hard_state)?;
            self.saved_hard_state = hard_state;
        }

        let shard_id = self.shard_id();
        let node_id = self.node.id();
        for (to, msg) in self.node.take_messages() {
            let frame = WireFrame::new(shard_id, node_id, msg).encode()?;
            if let Err(e) = self.transport.send(to, frame).await {
                tracing::trace!(shard_id = %shard_id, to = %to, error = %e, "raft send failed");
            }
        }

        for entry in self.node.take_committed_entries() {
            self.apply(entry)?;
        }
        self.maybe_snapshot()?;
        self.publish_status(false);
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: RaftSnapshot) -> Result<(), MetaError> {
        let index = self.state_machine.restore(&snapshot.data)?;
        if index != snapshot.last_included_index {
            return Err(MetaError::LogCorrupted {
                shard: self.shard_id(),
                reason: format!(
                    "snapshot image at {} labelled {}",
                    index, snapshot.last_included_index
                ),
            });
        }
        self.store.save_snapshot(&snapshot)?;
        self.store.compact_through(snapshot.last_included_index)?;
        self.snapshot_index = snapshot.last_included_index;

        // outcomes of entries covered by the image are unknown here
        let covered: Vec<LogIndex> = self
            .pending
            .range(..=snapshot.last_included_index)
            .map(|(i, _)| *i)
            .collect();
        for index in covered {
            if let Some(p) = self.pending.remove(&index) {
                let _ = p.reply.send(Err(MetaError::ProposalTimeout));
            }
        }
        Ok(())
    }

    fn apply(&mut self, entry: LogEntry) -> Result<(), MetaError> {
        let outcome = self.state_machine.apply(&entry)?;
        if outcome.status != ApplyStatus::AlreadyApplied {
            for observer in &self.observers {
                observer.on_applied(self.shard_id(), &entry, &outcome);
            }
            let _ = self.applied.send(outcome.clone());
        }
        if let Some(p) = self.pending.remove(&entry.index) {
            let result = if p.term == entry.term {
                outcome.into_result()
            } else {
                // our entry was overwritten by another leader's
                Err(MetaError::NotLeader {
                    leader_hint: self.node.leader_id(),
                })
            };
            let _ = p.reply.send(result);
        }
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<(), MetaError> {
        let applied = self.state_machine.last_applied();
        if !self
            .config
            .snapshot
            .should_snapshot(self.snapshot_index, applied)
        {
            return Ok(());
        }
        let data = self.state_machine.snapshot()?;
        let snapshot = RaftSnapshot::new(applied, self.state_machine.last_applied_term(), data);
        self.store.save_snapshot(&snapshot)?;
        self.node
            .compact(snapshot, self.config.snapshot.compact_to(applied));
        self.store.compact_through(self.node.first_index().prev())?;
        self.snapshot_index = applied;
        tracing::info!(
            shard_id = %self.shard_id(),
            snapshot_index = %applied,
            log_start = %self.node.first_index(),
            "took state machine snapshot"
        );
        Ok(())
    }

    fn publish_status(&mut self, halted: bool) {
        let leader = self.node.leader_id();
        let term = self.node.current_term();
        if (leader, term) != self.last_leader {
            match leader {
                Some(l) => self.router.observe_leader(self.shard_id(), l, term),
                None => self.router.clear_leader(self.shard_id(), term),
            }
            self.last_leader = (leader, term);
        }
        let next = GroupStatus {
            shard_id: self.shard_id(),
            node_id: self.node.id(),
            state: self.node.state(),
            term,
            leader,
            commit_index: self.node.commit_index(),
            last_applied: self.state_machine.last_applied(),
            quorum_lost: self.node.is_quorum_lost(),
            halted,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn halt(&mut self, err: MetaError) {
        let shard_id = self.shard_id();
        tracing::error!(
            node_id = %self.node.id(),
            shard_id = %shard_id,
            error = %err,
            "shard group halted, operator intervention required"
        );
        self.fail_pending(|| MetaError::ShardHalted(shard_id));
        self.router.clear_leader(shard_id, self.node.current_term());
        self.publish_status(true);
    }

    async fn serve_halted(
        shard_id: ShardId,
        mut proposals: mpsc::Receiver<Proposal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(proposal) = proposals.recv() => {
                    let _ = proposal.reply.send(Err(MetaError::ShardHalted(shard_id)));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
