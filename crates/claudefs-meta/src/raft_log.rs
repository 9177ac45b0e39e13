//! Durable Raft state for one shard: hard state, log entries and the latest snapshot.
//!
//! Keys live under `raft/`. On recovery the stored log is checked for gaps
//! and decreasing terms; any inconsistency is reported as
//! [`MetaError::LogCorrupted`] and the shard must not start.

use std::sync::Arc;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::kvstore::{BatchOp, KvStore};
use crate::snapshot::RaftSnapshot;
use crate::types::{LogEntry, LogIndex, MetaError, NodeId, ShardId, Term};

const KEY_HARD_STATE: &[u8] = b"raft/hard_state";
const KEY_SNAPSHOT: &[u8] = b"raft/snapshot";
const PREFIX_LOG: &[u8] = b"raft/log/";

fn log_entry_key(index: LogIndex) -> Vec<u8> {
    let mut key = PREFIX_LOG.to_vec();
    key.extend_from_slice(&index.as_u64().to_be_bytes());
    key
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// Term and vote that must survive restarts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term seen
    pub term: Term,
    /// Candidate voted for in `term`
    pub voted_for: Option<NodeId>,
    /// Highest index known committed
    pub commit_index: LogIndex,
}

/// Everything needed to rebuild a `RaftNode` after restart.
#[derive(Debug, Default)]
pub struct RecoveredLog {
    /// Persisted hard state
    pub hard_state: HardState,
    /// Latest snapshot, if any
    pub snapshot: Option<RaftSnapshot>,
    /// Log entries after the compaction point, in order
    pub entries: Vec<LogEntry>,
}

/// Persistent storage for one shard's Raft state.
pub struct RaftLogStore {
    kv: Arc<dyn KvStore>,
    shard_id: ShardId,
}

impl RaftLogStore {
    /// Creates a log store for `shard_id` backed by `kv`.
    pub fn new(kv: Arc<dyn KvStore>, shard_id: ShardId) -> Self {
        Self { kv, shard_id }
    }

    fn corrupted(&self, reason: String) -> MetaError {
        MetaError::LogCorrupted {
            shard: self.shard_id,
            reason,
        }
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, MetaError> {
        codec()
            .serialize(value)
            .map_err(|e| MetaError::Codec(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MetaError> {
        codec()
            .deserialize(bytes)
            .map_err(|e| self.corrupted(e.to_string()))
    }

    /// Persists term, vote and commit index in one write.
    pub fn save_hard_state(&self, state: &HardState) -> Result<(), MetaError> {
        self.kv.put(KEY_HARD_STATE.to_vec(), self.encode(state)?)
    }

    /// Loads the hard state; defaults when never saved.
    pub fn load_hard_state(&self) -> Result<HardState, MetaError> {
        match self.kv.get(KEY_HARD_STATE)? {
            Some(bytes) => self.decode(&bytes),
            None => Ok(HardState::default()),
        }
    }

    /// Appends entries atomically, replacing any stored entry at the same index.
    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<(), MetaError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(entries.len());
        for entry in entries {
            ops.push(BatchOp::Put {
                key: log_entry_key(entry.index),
                value: self.encode(entry)?,
            });
        }
        self.kv.write_batch(ops)
    }

    /// Entries in `[start, end]`.
    pub fn get_entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>, MetaError> {
        if start > end {
            return Ok(Vec::new());
        }
        self.kv
            .scan_range(&log_entry_key(start), &log_entry_key(end.next()))?
            .into_iter()
            .map(|(_, v)| self.decode(&v))
            .collect()
    }

    /// Removes every entry at or after `index`.
    pub fn truncate_from(&self, index: LogIndex) -> Result<(), MetaError> {
        let ops: Vec<BatchOp> = self
            .kv
            .scan_range(&log_entry_key(index), &log_entry_key(LogIndex::new(u64::MAX)))?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.kv.write_batch(ops)
    }

    /// Removes every entry at or before `index`.
    pub fn compact_through(&self, index: LogIndex) -> Result<(), MetaError> {
        let ops: Vec<BatchOp> = self
            .kv
            .scan_range(&log_entry_key(LogIndex::ZERO), &log_entry_key(index.next()))?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        if ops.is_empty() {
            return Ok(());
        }
        self.kv.write_batch(ops)
    }

    /// Stores the latest snapshot, replacing the previous one.
    pub fn save_snapshot(&self, snapshot: &RaftSnapshot) -> Result<(), MetaError> {
        self.kv.put(KEY_SNAPSHOT.to_vec(), self.encode(snapshot)?)
    }

    /// Loads the latest snapshot.
    pub fn load_snapshot(&self) -> Result<Option<RaftSnapshot>, MetaError> {
        match self.kv.get(KEY_SNAPSHOT)? {
            Some(bytes) => Ok(Some(self.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Loads and checks everything persisted for the shard.
    pub fn recover(&self) -> Result<RecoveredLog, MetaError> {
        let hard_state = self.load_hard_state()?;
        let snapshot = self.load_snapshot()?;
        let mut entries = Vec::new();
        for (key, value) in self.kv.scan_prefix(PREFIX_LOG)? {
            let entry: LogEntry = self.decode(&value)?;
            if key != log_entry_key(entry.index) {
                return Err(self.corrupted(format!(
                    "entry {} stored under a different key",
                    entry.index
                )));
            }
            entries.push(entry);
        }

        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index.next() {
                return Err(self.corrupted(format!(
                    "gap between {} and {}",
                    pair[0].index, pair[1].index
                )));
            }
            if pair[1].term < pair[0].term {
                return Err(self.corrupted(format!(
                    "term decreases at index {}",
                    pair[1].index
                )));
            }
        }

        let floor = snapshot
            .as_ref()
            .map(|s| s.last_included_index)
            .unwrap_or(LogIndex::ZERO);
        if let Some(first) = entries.first() {
            if first.index > floor.next() {
                return Err(self.corrupted(format!(
                    "log starts at {} but snapshot ends at {}",
                    first.index, floor
                )));
            }
        }
        // entries below the snapshot are redundant; keep only the suffix
        entries.retain(|e| e.index > floor);

        let last = entries.last().map(|e| e.index).unwrap_or(floor);
        if hard_state.commit_index > last {
            return Err(self.corrupted(format!(
                "commit index {} beyond last entry {}",
                hard_state.commit_index, last
            )));
        }
        if let Some(last_entry) = entries.last() {
            if last_entry.term > hard_state.term {
                return Err(self.corrupted(format!(
                    "entry {} has term {} above hard state term {}",
                    last_entry.index, last_entry.term, hard_state.term
                )));
            }
        }

        tracing::debug!(
            shard_id = %self.shard_id,
            term = %hard_state.term,
            entries = entries.len(),
            snapshot = %floor,
            "recovered raft log"
        );
        Ok(RecoveredLog {
            hard_state,
            snapshot,
            entries,
        })
    }

    /// Writes raw bytes for a log key. Only used to simulate media corruption in tests.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, index: LogIndex, bytes: Vec<u8>) -> Result<(), MetaError> {
        self.kv.put(log_entry_key(index), bytes)
    }
}
