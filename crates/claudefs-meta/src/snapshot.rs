//! Snapshots for log compaction and follower catch-up.

use serde::{Deserialize, Serialize};

use crate::types::*;

/// State-machine image covering every entry up to `last_included_index`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftSnapshot {
    /// Last log index covered by the image.
    pub last_included_index: LogIndex,
    /// Term of that index.
    pub last_included_term: Term,
    /// Serialized state-machine tables.
    pub data: Vec<u8>,
}

impl RaftSnapshot {
    /// Creates a new snapshot.
    pub fn new(last_included_index: LogIndex, last_included_term: Term, data: Vec<u8>) -> Self {
        Self {
            last_included_index,
            last_included_term,
            data,
        }
    }
}

/// Decides when a group should snapshot and how much log to keep behind it.
#[derive(Clone, Debug)]
pub struct SnapshotPolicy {
    /// Applied entries since the last snapshot that trigger a new one.
    pub threshold: u64,
    /// Entries retained below the snapshot point for slightly lagging followers.
    pub trailing: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            threshold: 10_000,
            trailing: 1_000,
        }
    }
}

impl SnapshotPolicy {
    /// True once `last_applied` is far enough past `snapshot_index`.
    pub fn should_snapshot(&self, snapshot_index: LogIndex, last_applied: LogIndex) -> bool {
        self.threshold > 0
            && last_applied.as_u64().saturating_sub(snapshot_index.as_u64()) >= self.threshold
    }

    /// Highest index that may be dropped from the log after snapshotting at `snapshot_index`.
    pub fn compact_to(&self, snapshot_index: LogIndex) -> LogIndex {
        LogIndex::new(snapshot_index.as_u64().saturating_sub(self.trailing))
    }
}
