//! Raft consensus for a single metadata shard.
//!
//! `RaftNode` is a deterministic, tick-driven state machine with no I/O.
//! Callers feed it ticks and inbound messages, then drain outbound messages
//! ([`RaftNode::take_messages`]), log changes to persist
//! ([`RaftNode::take_unstable`]) and newly committed entries
//! ([`RaftNode::take_committed_entries`]). The shard group task in
//! `group.rs` does exactly that; tests drive it by hand.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::raft_log::{HardState, RecoveredLog};
use crate::snapshot::RaftSnapshot;
use crate::types::*;

/// Configuration for a Raft node.
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// This node's unique identifier.
    pub node_id: NodeId,
    /// Shard this group replicates.
    pub shard_id: ShardId,
    /// Other replicas of the shard (excluding this node).
    pub peers: Vec<NodeId>,
    /// Lower bound of the randomized election timeout, in ticks.
    pub election_timeout_min_ticks: u64,
    /// Upper bound of the randomized election timeout, in ticks.
    pub election_timeout_max_ticks: u64,
    /// Leader heartbeat period, in ticks.
    pub heartbeat_interval_ticks: u64,
    /// Cap on entries carried by one AppendEntries.
    pub max_entries_per_message: usize,
    /// Refuse proposals when the leader has not heard from a quorum within an election timeout.
    pub check_quorum: bool,
    /// Seed for election timeout jitter; random when None.
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(0),
            shard_id: ShardId::new(0),
            peers: Vec::new(),
            election_timeout_min_ticks: 15,
            election_timeout_max_ticks: 30,
            heartbeat_interval_ticks: 5,
            max_entries_per_message: 256,
            check_quorum: true,
            rng_seed: None,
        }
    }
}

/// Log suffix that must be written to durable storage.
#[derive(Debug, PartialEq, Eq)]
pub struct LogChanges {
    /// Stored entries at or after this index are stale and must be dropped first.
    pub truncate_from: LogIndex,
    /// Entries to append after truncation.
    pub entries: Vec<LogEntry>,
}

/// A Raft participant for one shard.
pub struct RaftNode {
    config: RaftConfig,
    state: RaftState,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Vec<LogEntry>,
    log_offset: LogIndex,
    log_offset_term: Term,
    snapshot: Option<RaftSnapshot>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    votes_received: HashSet<NodeId>,
    recent_active: HashSet<NodeId>,
    quorum_lost: bool,
    election_elapsed: u64,
    heartbeat_elapsed: u64,
    randomized_election_timeout: u64,
    rng: StdRng,
    msgs: Vec<(NodeId, RaftMessage)>,
    unstable_from: Option<LogIndex>,
    pending_snapshot: Option<RaftSnapshot>,
    term_start: LogIndex,
}

impl RaftNode {
    /// Create a new Raft node starting as a Follower with an empty log.
    pub fn new(config: RaftConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        tracing::debug!(
            node_id = %config.node_id,
            shard_id = %config.shard_id,
            peers = ?config.peers,
            "creating raft node as follower"
        );
        let mut node = Self {
            config,
            state: RaftState::Follower,
            current_term: Term::ZERO,
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            log_offset: LogIndex::ZERO,
            log_offset_term: Term::ZERO,
            snapshot: None,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            recent_active: HashSet::new(),
            quorum_lost: false,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            rng,
            msgs: Vec::new(),
            unstable_from: None,
            pending_snapshot: None,
            term_start: LogIndex::ZERO,
        };
        node.reset_election_timeout();
        node
    }

    /// Rebuild a node from durable state. `applied` is the state machine's cursor.
    pub fn restore(config: RaftConfig, recovered: RecoveredLog, applied: LogIndex) -> Self {
        let mut node = Self::new(config);
        node.current_term = recovered.hard_state.term;
        node.voted_for = recovered.hard_state.voted_for;
        if let Some(snapshot) = recovered.snapshot {
            node.log_offset = snapshot.last_included_index;
            node.log_offset_term = snapshot.last_included_term;
            node.snapshot = Some(snapshot);
        }
        node.log = recovered.entries;
        if let Some(first) = node.log.first() {
            // entries retained below the snapshot point
            node.log_offset = first.index.prev();
            node.log_offset_term = match &node.snapshot {
                Some(s) if s.last_included_index == node.log_offset => s.last_included_term,
                _ => node.log_offset_term,
            };
        }
        node.last_applied = applied;
        node.commit_index = recovered
            .hard_state
            .commit_index
            .max(applied)
            .min(node.last_log_index());
        tracing::info!(
            node_id = %node.config.node_id,
            shard_id = %node.config.shard_id,
            term = %node.current_term,
            last_log_index = %node.last_log_index(),
            commit_index = %node.commit_index,
            "restored raft node"
        );
        node
    }

    /// This node's id.
    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    /// Shard replicated by this node.
    pub fn shard_id(&self) -> ShardId {
        self.config.shard_id
    }

    /// Peers of this node.
    pub fn peers(&self) -> &[NodeId] {
        &self.config.peers
    }

    /// Get the current term.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// Get the current state.
    pub fn state(&self) -> RaftState {
        self.state
    }

    /// Last known leader of the shard.
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Get the commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Get the last applied index.
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Get the node this node voted for in the current term.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// True if this leader has lost contact with a quorum.
    pub fn is_quorum_lost(&self) -> bool {
        self.quorum_lost
    }

    /// Durable part of the node's state.
    pub fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        }
    }

    /// Index of the entry preceding the first in-memory entry.
    pub fn first_index(&self) -> LogIndex {
        self.log_offset.next()
    }

    /// Get the last log index.
    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::new(self.log_offset.as_u64() + self.log.len() as u64)
    }

    /// Get the term of the last log entry.
    pub fn last_log_term(&self) -> Term {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or(self.log_offset_term)
    }

    /// Get a specific log entry by index.
    pub fn log_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.log_offset {
            return None;
        }
        let pos = (index.as_u64() - self.log_offset.as_u64() - 1) as usize;
        self.log.get(pos)
    }

    /// Term of the entry at `index`, if known.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        if index == self.log_offset {
            return Some(self.log_offset_term);
        }
        self.log_entry(index).map(|e| e.term)
    }

    /// Latest local snapshot.
    pub fn snapshot(&self) -> Option<&RaftSnapshot> {
        self.snapshot.as_ref()
    }

    fn quorum(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }

    fn reset_election_timeout(&mut self) {
        let min = self.config.election_timeout_min_ticks.max(1);
        let max = self.config.election_timeout_max_ticks.max(min);
        self.randomized_election_timeout = self.rng.gen_range(min..=max);
        self.election_elapsed = 0;
    }

    fn mark_unstable(&mut self, from: LogIndex) {
        self.unstable_from = Some(match self.unstable_from {
            Some(current) => current.min(from),
            None => from,
        });
    }

    fn send(&mut self, to: NodeId, msg: RaftMessage) {
        self.msgs.push((to, msg));
    }

    /// Advance logical time by one tick.
    pub fn tick(&mut self) {
        match self.state {
            RaftState::Leader => self.tick_leader(),
            RaftState::Follower | RaftState::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election_timeout {
                    self.start_election();
                }
            }
        }
    }

    fn tick_leader(&mut self) {
        self.heartbeat_elapsed += 1;
        if self.heartbeat_elapsed >= self.config.heartbeat_interval_ticks {
            self.broadcast_append();
        }

        self.election_elapsed += 1;
        if self.election_elapsed < self.config.election_timeout_min_ticks {
            return;
        }
        self.election_elapsed = 0;
        if !self.config.check_quorum {
            return;
        }
        let active = self.recent_active.len() + 1;
        let lost = active < self.quorum();
        if lost != self.quorum_lost {
            if lost {
                tracing::warn!(
                    node_id = %self.config.node_id,
                    shard_id = %self.config.shard_id,
                    term = %self.current_term,
                    active,
                    quorum = self.quorum(),
                    "leader lost contact with quorum, shard is read-only"
                );
            } else {
                tracing::info!(
                    node_id = %self.config.node_id,
                    shard_id = %self.config.shard_id,
                    term = %self.current_term,
                    "leader regained quorum"
                );
            }
        }
        self.quorum_lost = lost;
        self.recent_active.clear();
    }

    /// Transition to Candidate, increment term, vote for self and request votes.
    pub fn start_election(&mut self) {
        self.state = RaftState::Candidate;
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.config.node_id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);
        self.reset_election_timeout();

        tracing::info!(
            node_id = %self.config.node_id,
            shard_id = %self.config.shard_id,
            term = %self.current_term,
            "starting election"
        );

        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let msg = RaftMessage::RequestVote {
            term: self.current_term,
            candidate_id: self.config.node_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        for peer in self.config.peers.clone() {
            self.send(peer, msg.clone());
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.current_term {
            tracing::info!(
                node_id = %self.config.node_id,
                shard_id = %self.config.shard_id,
                old_term = %self.current_term,
                new_term = %term,
                was = %self.state,
                "stepping down to follower due to higher term"
            );
            self.current_term = term;
            self.voted_for = None;
        }
        self.state = RaftState::Follower;
        self.leader_id = leader;
        self.votes_received.clear();
        self.quorum_lost = false;
        self.reset_election_timeout();
    }

    fn become_leader(&mut self) {
        tracing::info!(
            node_id = %self.config.node_id,
            shard_id = %self.config.shard_id,
            term = %self.current_term,
            votes = self.votes_received.len(),
            "won election, becoming leader"
        );
        self.state = RaftState::Leader;
        self.leader_id = Some(self.config.node_id);
        self.quorum_lost = false;
        self.recent_active.clear();
        self.election_elapsed = 0;
        let next = self.last_log_index().next();
        for peer in &self.config.peers {
            self.next_index.insert(*peer, next);
            self.match_index.insert(*peer, LogIndex::ZERO);
        }
        // Inherited entries only commit behind an entry of this term.
        self.term_start = self.last_log_index();
        if self.term_start > self.commit_index {
            let index = self.term_start.next();
            self.log.push(LogEntry {
                index,
                term: self.current_term,
                op: MetaOp::Noop,
            });
            self.mark_unstable(index);
            self.term_start = index;
        }
        self.broadcast_append();
        self.maybe_commit();
    }

    /// The index a leader must apply before serving requests of its term:
    /// its election no-op, or the end of an already committed log.
    pub fn term_start_index(&self) -> LogIndex {
        self.term_start
    }

    /// Propose a new operation. Only the leader of a quorum accepts.
    pub fn propose(&mut self, op: MetaOp) -> Result<LogIndex, MetaError> {
        if self.state != RaftState::Leader {
            return Err(MetaError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        if self.quorum_lost {
            return Err(MetaError::QuorumUnavailable {
                shard: self.config.shard_id,
            });
        }

        let index = self.last_log_index().next();
        tracing::debug!(
            node_id = %self.config.node_id,
            shard_id = %self.config.shard_id,
            term = %self.current_term,
            index = %index,
            op = op.kind(),
            "proposing new entry"
        );
        self.log.push(LogEntry {
            index,
            term: self.current_term,
            op,
        });
        self.mark_unstable(index);
        self.broadcast_append();
        self.maybe_commit();
        Ok(index)
    }

    /// Feed one inbound message from `from`.
    pub fn step(&mut self, from: NodeId, msg: RaftMessage) {
        let term = msg.term();
        if term > self.current_term {
            let leader = match &msg {
                RaftMessage::AppendEntries { leader_id, .. }
                | RaftMessage::InstallSnapshot { leader_id, .. } => Some(*leader_id),
                _ => None,
            };
            self.become_follower(term, leader);
        }

        match msg {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let reply =
                    self.handle_request_vote(term, candidate_id, last_log_index, last_log_term);
                self.send(from, reply);
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                self.handle_vote_response(from, term, vote_granted);
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let reply = self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                self.send(from, reply);
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                self.handle_append_response(from, term, success, match_index);
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                data,
            } => {
                let reply = self.handle_install_snapshot(
                    term,
                    leader_id,
                    RaftSnapshot::new(last_included_index, last_included_term, data),
                );
                self.send(from, reply);
            }
            RaftMessage::InstallSnapshotResponse {
                term,
                last_included_index,
            } => {
                self.handle_install_snapshot_response(from, term, last_included_index);
            }
        }
    }

    fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index())
    }

    fn handle_request_vote(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> RaftMessage {
        let vote_granted = if term < self.current_term {
            false
        } else if self.voted_for.is_some_and(|v| v != candidate_id) {
            false
        } else {
            self.is_log_up_to_date(last_log_index, last_log_term)
        };

        if vote_granted {
            self.voted_for = Some(candidate_id);
            self.reset_election_timeout();
        }
        tracing::debug!(
            node_id = %self.config.node_id,
            shard_id = %self.config.shard_id,
            term = %self.current_term,
            candidate_id = %candidate_id,
            vote_granted,
            "handled RequestVote"
        );
        RaftMessage::RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    fn handle_vote_response(&mut self, from: NodeId, term: Term, vote_granted: bool) {
        if self.state != RaftState::Candidate || term != self.current_term {
            return;
        }
        if vote_granted {
            self.votes_received.insert(from);
        }
        if self.votes_received.len() >= self.quorum() {
            self.become_leader();
        }
    }

    fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        mut prev_log_index: LogIndex,
        mut prev_log_term: Term,
        mut entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> RaftMessage {
        if term < self.current_term {
            return RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: self.last_log_index(),
            };
        }
        if self.state != RaftState::Follower || self.leader_id != Some(leader_id) {
            self.become_follower(term, Some(leader_id));
        } else {
            self.election_elapsed = 0;
        }

        // everything at or below the compaction point is committed already
        if prev_log_index < self.log_offset {
            entries.retain(|e| e.index > self.log_offset);
            prev_log_index = self.log_offset;
            prev_log_term = self.log_offset_term;
        }

        if self.term_at(prev_log_index) != Some(prev_log_term) {
            tracing::debug!(
                node_id = %self.config.node_id,
                shard_id = %self.config.shard_id,
                prev_log_index = %prev_log_index,
                expected_term = %prev_log_term,
                actual_term = ?self.term_at(prev_log_index),
                "rejecting AppendEntries: log mismatch"
            );
            let hint = prev_log_index.prev().min(self.last_log_index());
            return RaftMessage::AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: hint,
            };
        }

        let last_new = LogIndex::new(prev_log_index.as_u64() + entries.len() as u64);
        for entry in entries {
            match self.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        tracing::error!(
                            node_id = %self.config.node_id,
                            shard_id = %self.config.shard_id,
                            index = %entry.index,
                            commit_index = %self.commit_index,
                            "leader sent a conflicting committed entry, ignoring"
                        );
                        continue;
                    }
                    let keep = (entry.index.as_u64() - self.log_offset.as_u64() - 1) as usize;
                    tracing::debug!(
                        node_id = %self.config.node_id,
                        shard_id = %self.config.shard_id,
                        from = %entry.index,
                        dropped = self.log.len() - keep,
                        "truncating conflicting log suffix"
                    );
                    self.log.truncate(keep);
                    self.mark_unstable(entry.index);
                    self.log.push(entry);
                }
                None => {
                    self.mark_unstable(entry.index);
                    self.log.push(entry);
                }
            }
        }

        if leader_commit > self.commit_index {
            let new_commit = leader_commit.min(last_new);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
            }
        }

        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: last_new,
        }
    }

    fn handle_append_response(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        match_index: LogIndex,
    ) {
        if self.state != RaftState::Leader || term != self.current_term {
            return;
        }
        self.recent_active.insert(from);

        if success {
            let matched = self
                .match_index
                .get(&from)
                .copied()
                .unwrap_or(LogIndex::ZERO)
                .max(match_index);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, matched.next());
            self.maybe_commit();
            if matched < self.last_log_index() {
                self.send_append(from);
            }
        } else {
            let current = self
                .next_index
                .get(&from)
                .copied()
                .unwrap_or(self.last_log_index().next());
            let next = current.prev().min(match_index.next()).max(LogIndex::new(1));
            tracing::debug!(
                node_id = %self.config.node_id,
                shard_id = %self.config.shard_id,
                peer = %from,
                old_next = %current,
                new_next = %next,
                "follower rejected append, backing off"
            );
            self.next_index.insert(from, next);
            self.send_append(from);
        }
    }

    fn handle_install_snapshot(
        &mut self,
        term: Term,
        leader_id: NodeId,
        snapshot: RaftSnapshot,
    ) -> RaftMessage {
        if term < self.current_term {
            return RaftMessage::InstallSnapshotResponse {
                term: self.current_term,
                last_included_index: self.commit_index,
            };
        }
        if self.state != RaftState::Follower || self.leader_id != Some(leader_id) {
            self.become_follower(term, Some(leader_id));
        } else {
            self.election_elapsed = 0;
        }

        let index = snapshot.last_included_index;
        if index <= self.commit_index {
            return RaftMessage::InstallSnapshotResponse {
                term: self.current_term,
                last_included_index: self.commit_index,
            };
        }

        tracing::info!(
            node_id = %self.config.node_id,
            shard_id = %self.config.shard_id,
            last_included_index = %index,
            last_included_term = %snapshot.last_included_term,
            "installing snapshot from leader"
        );

        if self.term_at(index) == Some(snapshot.last_included_term) {
            let drop = (index.as_u64() - self.log_offset.as_u64()) as usize;
            self.log.drain(..drop);
        } else {
            self.log.clear();
        }
        self.log_offset = index;
        self.log_offset_term = snapshot.last_included_term;
        self.commit_index = index;
        self.last_applied = index;
        self.mark_unstable(index.next());
        self.snapshot = Some(snapshot.clone());
        self.pending_snapshot = Some(snapshot);

        RaftMessage::InstallSnapshotResponse {
            term: self.current_term,
            last_included_index: index,
        }
    }

    fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        term: Term,
        last_included_index: LogIndex,
    ) {
        if self.state != RaftState::Leader || term != self.current_term {
            return;
        }
        self.recent_active.insert(from);
        let matched = self
            .match_index
            .get(&from)
            .copied()
            .unwrap_or(LogIndex::ZERO)
            .max(last_included_index);
        self.match_index.insert(from, matched);
        self.next_index.insert(from, matched.next());
        self.maybe_commit();
        if matched < self.last_log_index() {
            self.send_append(from);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index().next());

        if next <= self.log_offset {
            if let Some(snapshot) = &self.snapshot {
                let msg = RaftMessage::InstallSnapshot {
                    term: self.current_term,
                    leader_id: self.config.node_id,
                    last_included_index: snapshot.last_included_index,
                    last_included_term: snapshot.last_included_term,
                    data: snapshot.data.clone(),
                };
                self.send(peer, msg);
                return;
            }
        }

        let next = next.max(self.log_offset.next());
        let prev_log_index = next.prev();
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(Term::ZERO);
        let start = (next.as_u64() - self.log_offset.as_u64() - 1) as usize;
        let end = (start + self.config.max_entries_per_message).min(self.log.len());
        let entries = if start < end {
            self.log[start..end].to_vec()
        } else {
            Vec::new()
        };
        let msg = RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.config.node_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        self.send(peer, msg);
    }

    fn broadcast_append(&mut self) {
        self.heartbeat_elapsed = 0;
        for peer in self.config.peers.clone() {
            self.send_append(peer);
        }
    }

    /// Commit the highest current-term index held by a quorum.
    fn maybe_commit(&mut self) {
        if self.state != RaftState::Leader {
            return;
        }
        let mut n = self.last_log_index();
        while n > self.commit_index {
            if self.term_at(n) != Some(self.current_term) {
                // earlier-term entries commit only underneath a current-term entry
                break;
            }
            let replicas = 1 + self
                .config
                .peers
                .iter()
                .filter(|p| self.match_index.get(p).is_some_and(|m| *m >= n))
                .count();
            if replicas >= self.quorum() {
                tracing::debug!(
                    node_id = %self.config.node_id,
                    shard_id = %self.config.shard_id,
                    old_commit = %self.commit_index,
                    new_commit = %n,
                    "advancing commit index"
                );
                self.commit_index = n;
                break;
            }
            n = n.prev();
        }
    }

    /// Entries committed since the last call, in index order.
    pub fn take_committed_entries(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            let next = self.last_applied.next();
            match self.log_entry(next) {
                Some(entry) => entries.push(entry.clone()),
                None => break,
            }
            self.last_applied = next;
        }
        entries
    }

    /// Outbound messages produced since the last call.
    pub fn take_messages(&mut self) -> Vec<(NodeId, RaftMessage)> {
        std::mem::take(&mut self.msgs)
    }

    /// Log changes not yet written to durable storage.
    pub fn take_unstable(&mut self) -> Option<LogChanges> {
        let from = self.unstable_from.take()?;
        let start = from.max(self.log_offset.next());
        let entries = if start <= self.last_log_index() {
            let pos = (start.as_u64() - self.log_offset.as_u64() - 1) as usize;
            self.log[pos..].to_vec()
        } else {
            Vec::new()
        };
        Some(LogChanges {
            truncate_from: from,
            entries,
        })
    }

    /// Snapshot received from the leader that the state machine must load.
    pub fn take_pending_snapshot(&mut self) -> Option<RaftSnapshot> {
        self.pending_snapshot.take()
    }

    /// Record a local snapshot and drop log entries at or below `compact_to`.
    pub fn compact(&mut self, snapshot: RaftSnapshot, compact_to: LogIndex) {
        let compact_to = compact_to
            .min(snapshot.last_included_index)
            .min(self.last_applied);
        if compact_to > self.log_offset {
            if let Some(term) = self.term_at(compact_to) {
                let drop = (compact_to.as_u64() - self.log_offset.as_u64()) as usize;
                self.log.drain(..drop);
                self.log_offset = compact_to;
                self.log_offset_term = term;
            }
        }
        tracing::debug!(
            node_id = %self.config.node_id,
            shard_id = %self.config.shard_id,
            snapshot_index = %snapshot.last_included_index,
            log_offset = %self.log_offset,
            "compacted log"
        );
        self.snapshot = Some(snapshot);
    }
}
