//! Replicated entry type and tailer for cross-site replication.
//!
//! The tailer follows the local metadata journal and turns every entry that
//! originated on this site into a [`ReplicatedEntry`]. Entries that arrived
//! from another site are never shipped again.

use std::sync::Arc;

use bincode::Options;
use claudefs_meta::journal::{JournalEntry, MetadataJournal};
use claudefs_meta::{InodeId, LogEntry, ShardId, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};

use crate::error::ReplError;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

/// A committed log entry as shipped to a remote site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEntry {
    /// Incarnation of the origin journal.
    pub epoch: u64,
    /// Origin journal sequence, strictly increasing within an epoch.
    pub sequence: u64,
    /// Shard that committed the entry on the origin site.
    pub shard_id: ShardId,
    /// Change time recorded by the write.
    pub committed_at: Timestamp,
    /// Clock the write stamped on its target inode.
    pub clock: VectorClock,
    /// Clock the target inode carried before the write.
    pub base_clock: Option<VectorClock>,
    /// The committed entry.
    pub entry: LogEntry,
}

impl ReplicatedEntry {
    /// Inode whose clock decides conflicts for this entry.
    pub fn inode(&self) -> Option<InodeId> {
        self.entry.op.primary_inode()
    }

    /// Deterministic encoding used for batch authentication.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, ReplError> {
        Ok(codec().serialize(self)?)
    }
}

impl From<JournalEntry> for ReplicatedEntry {
    fn from(e: JournalEntry) -> Self {
        Self {
            epoch: e.epoch,
            sequence: e.sequence,
            shard_id: e.shard_id,
            committed_at: e.committed_at,
            clock: e.vector_clock,
            base_clock: e.base_clock,
            entry: LogEntry {
                index: e.log_index,
                term: e.term,
                op: e.op,
            },
        }
    }
}

/// Streams locally originated entries from the metadata journal.
pub struct JournalTailer {
    journal: Arc<MetadataJournal>,
    /// Last journal sequence handed out.
    position: u64,
}

impl JournalTailer {
    /// Starts tailing after `position` (0 = from the beginning).
    pub fn new(journal: Arc<MetadataJournal>, position: u64) -> Self {
        Self { journal, position }
    }

    /// Last journal sequence consumed.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns up to `limit` shippable entries without waiting.
    ///
    /// Entries dropped by journal retention are skipped with an error log.
    pub fn poll(&mut self, limit: usize) -> Result<Vec<ReplicatedEntry>, ReplError> {
        if let Some(oldest) = self.journal.oldest_sequence()? {
            if oldest > self.position + 1 {
                tracing::error!(
                    from = self.position + 1,
                    to = oldest - 1,
                    "journal entries expired before they were shipped"
                );
                self.position = oldest - 1;
            }
        }
        let mut out = Vec::new();
        while out.len() < limit {
            let entries = self
                .journal
                .read_from(self.position + 1, limit - out.len())?;
            let Some(last) = entries.last() else {
                break;
            };
            self.position = last.sequence;
            out.extend(
                entries
                    .into_iter()
                    .filter(JournalEntry::is_shippable)
                    .map(ReplicatedEntry::from),
            );
        }
        Ok(out)
    }

    /// Waits until at least one new journal entry exists, then polls.
    pub async fn next_batch(&mut self, limit: usize) -> Result<Vec<ReplicatedEntry>, ReplError> {
        loop {
            self.journal.wait_for(self.position).await;
            let entries = self.poll(limit)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claudefs_meta::state_machine::{ApplyOutcome, ApplyStatus};
    use claudefs_meta::{LogIndex, MetaOp, Term};

    fn record(journal: &MetadataJournal, index: u64, op: MetaOp) {
        let entry = LogEntry {
            index: LogIndex::new(index),
            term: Term::new(1),
            op,
        };
        let outcome = ApplyOutcome {
            index: entry.index,
            term: entry.term,
            status: ApplyStatus::Applied,
            clock: VectorClock::new(1, index),
            primary: entry.op.primary_inode(),
            prior_clock: None,
            attr: None,
            entry: None,
            affected_inodes: vec![],
            affected_names: vec![],
            deleted_inodes: vec![],
            orphaned_inodes: vec![],
            changed_at: None,
        };
        journal.append(ShardId::new(0), &entry, &outcome).unwrap();
    }

    fn local(ino: u64) -> MetaOp {
        MetaOp::DeleteInode {
            ino: InodeId::new(ino),
        }
    }

    fn remote(ino: u64) -> MetaOp {
        MetaOp::Replicated {
            origin: VectorClock::new(2, 9),
            timestamp: Timestamp::new(5, 0),
            conflict: false,
            op: Box::new(local(ino)),
        }
    }

    #[test]
    fn test_poll_skips_replicated_entries() {
        let journal = Arc::new(MetadataJournal::new(100));
        record(&journal, 1, local(10));
        record(&journal, 2, remote(11));
        record(&journal, 3, local(12));

        let mut tailer = JournalTailer::new(journal, 0);
        let entries = tailer.poll(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 3);
        assert_eq!(entries[1].clock, VectorClock::new(1, 3));
        assert_eq!(tailer.position(), 3);
        assert!(tailer.poll(10).unwrap().is_empty());
    }

    #[test]
    fn test_poll_respects_limit_and_resumes() {
        let journal = Arc::new(MetadataJournal::new(100));
        for i in 1..=5 {
            record(&journal, i, local(i));
        }
        let mut tailer = JournalTailer::new(journal, 0);
        let first = tailer.poll(2).unwrap();
        assert_eq!(first.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        let rest = tailer.poll(10).unwrap();
        assert_eq!(rest.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_poll_jumps_over_expired_entries() {
        let journal = Arc::new(MetadataJournal::new(2));
        for i in 1..=5 {
            record(&journal, i, local(i));
        }
        let mut tailer = JournalTailer::new(journal, 0);
        let entries = tailer.poll(10).unwrap();
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn test_canonical_bytes_are_stable() {
        let journal = Arc::new(MetadataJournal::new(10));
        record(&journal, 1, local(7));
        let entry = JournalTailer::new(journal, 0).poll(1).unwrap().remove(0);
        assert_eq!(entry.canonical_bytes().unwrap(), entry.clone().canonical_bytes().unwrap());
        assert_eq!(entry.inode(), Some(InodeId::new(7)));
    }

    #[tokio::test]
    async fn test_next_batch_waits_for_append() {
        let journal = Arc::new(MetadataJournal::new(10));
        let mut tailer = JournalTailer::new(journal.clone(), 0);
        let waiter = tokio::spawn(async move { tailer.next_batch(10).await.unwrap() });
        tokio::task::yield_now().await;
        record(&journal, 1, local(3));
        let entries = waiter.await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
