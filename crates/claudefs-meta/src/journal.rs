//! Metadata journal for replication tailing.
//!
//! Records every applied metadata operation on this node in commit order,
//! across all shards. The cross-site replicator tails it asynchronously.
//! Each record carries the inode's clock after the write and its clock
//! before the write (`base_clock`), which remote sites use to tell a
//! follow-up write from a concurrent one.
//!
//! Sequences restart at 1 whenever a journal is created, so every journal
//! also carries an epoch taken from the wall clock at creation. Receivers
//! track progress per `(site, epoch)`.

use std::collections::VecDeque;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::group::ApplyObserver;
use crate::state_machine::ApplyOutcome;
use crate::types::*;

/// A journal entry with a sequence number for replication tracking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Incarnation of the journal that assigned `sequence`.
    pub epoch: u64,
    /// Monotonically increasing sequence number within the epoch.
    pub sequence: u64,
    /// Shard whose log committed the operation.
    pub shard_id: ShardId,
    /// The Raft log index of this operation.
    pub log_index: LogIndex,
    /// The Raft term of this operation.
    pub term: Term,
    /// The committed metadata operation.
    pub op: MetaOp,
    /// Change time recorded by the write, used for last-writer-wins.
    pub committed_at: Timestamp,
    /// Clock stamped on the target inode by this write.
    pub vector_clock: VectorClock,
    /// Clock the target inode carried before this write.
    pub base_clock: Option<VectorClock>,
}

impl JournalEntry {
    /// Returns true if the entry originated on this site and should be shipped.
    pub fn is_shippable(&self) -> bool {
        !self.op.is_replicated() && self.op != MetaOp::Noop
    }
}

struct JournalState {
    entries: VecDeque<JournalEntry>,
    next_sequence: u64,
}

/// The metadata journal: an append-only log of committed operations.
pub struct MetadataJournal {
    epoch: u64,
    state: RwLock<JournalState>,
    max_entries: usize,
    notify: Notify,
}

impl MetadataJournal {
    /// Create a new journal retaining at most `max_entries` records.
    pub fn new(max_entries: usize) -> Self {
        let now = Timestamp::now();
        Self::with_epoch(max_entries, now.secs * 1_000_000_000 + u64::from(now.nanos))
    }

    /// Create a journal with an explicit epoch. A restarted site must use a
    /// larger epoch than any it used before.
    pub fn with_epoch(max_entries: usize, epoch: u64) -> Self {
        Self {
            epoch,
            state: RwLock::new(JournalState {
                entries: VecDeque::new(),
                next_sequence: 1,
            }),
            max_entries: max_entries.max(1),
            notify: Notify::new(),
        }
    }

    /// Incarnation stamped on every entry of this journal.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Append a committed operation. Returns the assigned sequence number.
    pub fn append(
        &self,
        shard_id: ShardId,
        entry: &LogEntry,
        outcome: &ApplyOutcome,
    ) -> Result<u64, MetaError> {
        let committed_at = outcome
            .changed_at
            .or_else(|| outcome.attr.as_ref().map(|a| a.ctime))
            .unwrap_or_else(Timestamp::now);
        let sequence = {
            let mut state = self
                .state
                .write()
                .map_err(|e| MetaError::KvError(e.to_string()))?;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.entries.push_back(JournalEntry {
                epoch: self.epoch,
                sequence,
                shard_id,
                log_index: entry.index,
                term: entry.term,
                op: entry.op.clone(),
                committed_at,
                vector_clock: outcome.clock,
                base_clock: outcome.prior_clock,
            });
            while state.entries.len() > self.max_entries {
                state.entries.pop_front();
            }
            sequence
        };
        self.notify.notify_waiters();
        Ok(sequence)
    }

    /// Up to `limit` entries with sequence at or above `from_sequence`.
    pub fn read_from(&self, from_sequence: u64, limit: usize) -> Result<Vec<JournalEntry>, MetaError> {
        let state = self
            .state
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let start = state
            .entries
            .partition_point(|e| e.sequence < from_sequence);
        Ok(state.entries.range(start..).take(limit).cloned().collect())
    }

    /// Sequence number of the newest entry, 0 when nothing was appended.
    pub fn latest_sequence(&self) -> Result<u64, MetaError> {
        let state = self
            .state
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(state.next_sequence - 1)
    }

    /// Sequence number of the oldest retained entry.
    pub fn oldest_sequence(&self) -> Result<Option<u64>, MetaError> {
        let state = self
            .state
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(state.entries.front().map(|e| e.sequence))
    }

    /// Number of retained entries.
    pub fn len(&self) -> Result<usize, MetaError> {
        let state = self
            .state
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(state.entries.len())
    }

    /// Returns true if the journal is empty.
    pub fn is_empty(&self) -> Result<bool, MetaError> {
        Ok(self.len()? == 0)
    }

    /// How far `remote_sequence` trails the newest entry.
    pub fn replication_lag(&self, remote_sequence: u64) -> Result<u64, MetaError> {
        Ok(self.latest_sequence()?.saturating_sub(remote_sequence))
    }

    /// Drops entries below `sequence`; returns how many were removed.
    pub fn compact_before(&self, sequence: u64) -> Result<usize, MetaError> {
        let mut state = self
            .state
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let before = state.entries.len();
        while state.entries.front().is_some_and(|e| e.sequence < sequence) {
            state.entries.pop_front();
        }
        Ok(before - state.entries.len())
    }

    /// Waits until an entry newer than `after` exists.
    pub async fn wait_for(&self, after: u64) {
        loop {
            let notified = self.notify.notified();
            if self.latest_sequence().map_or(true, |latest| latest > after) {
                return;
            }
            notified.await;
        }
    }
}

impl ApplyObserver for MetadataJournal {
    fn on_applied(&self, shard_id: ShardId, entry: &LogEntry, outcome: &ApplyOutcome) {
        if !outcome.is_applied() || entry.op == MetaOp::Noop {
            return;
        }
        if let Err(e) = self.append(shard_id, entry, outcome) {
            tracing::error!(
                shard_id = %shard_id,
                index = %entry.index,
                error = %e,
                "failed to journal committed entry"
            );
        }
    }
}
