//! Replication WAL: progress marks for both directions of replication.
//!
//! Outbound cursors record how far the local journal has been delivered to
//! each remote site. Inbound marks record, per source site and journal
//! epoch, the highest batch sequence and entry sequence already applied;
//! anything at or below
//! a mark is a replay and changes nothing, except entries left unprocessed
//! by a failed batch: those stay eligible until a retransmit applies them.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// How far local entries have been delivered to one remote site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCursor {
    /// Remote site we are replicating TO.
    pub site_id: u64,
    /// Last journal sequence delivered.
    pub last_seq: u64,
    /// Last batch sequence delivered.
    pub last_batch: u64,
}

/// High-water marks for one source site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveMark {
    /// Journal epoch of the source the marks belong to.
    pub epoch: u64,
    /// Highest batch sequence fully processed.
    pub batch_seq: u64,
    /// Highest entry sequence applied or skipped.
    pub entry_seq: u64,
}

/// A single WAL record written when a mark advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// A batch was delivered to a remote site.
    Delivered {
        /// Destination site.
        site_id: u64,
        /// Batch sequence.
        batch_seq: u64,
        /// Last entry sequence in the batch.
        last_seq: u64,
    },
    /// A batch from a remote site was processed.
    Received {
        /// Source site.
        site_id: u64,
        /// Source journal epoch.
        epoch: u64,
        /// Batch sequence.
        batch_seq: u64,
        /// Highest entry sequence seen.
        entry_seq: u64,
    },
}

/// In-memory log of replication progress. After restart, outbound shipping
/// resumes from the last cursor and inbound replays are recognised by mark.
#[derive(Debug)]
pub struct ReplicationWal {
    cursors: HashMap<u64, ReplicationCursor>,
    marks: HashMap<u64, ReceiveMark>,
    unprocessed: HashMap<u64, BTreeSet<u64>>,
    history: Vec<WalRecord>,
    max_history: usize,
}

impl Default for ReplicationWal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationWal {
    /// Create a new empty replication WAL.
    pub fn new() -> Self {
        Self {
            cursors: HashMap::new(),
            marks: HashMap::new(),
            unprocessed: HashMap::new(),
            history: Vec::new(),
            max_history: 10_000,
        }
    }

    fn push(&mut self, record: WalRecord) {
        self.history.push(record);
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.history.drain(..excess);
        }
    }

    /// Record that batch `batch_seq`, ending at journal sequence `last_seq`, reached `site_id`.
    pub fn advance(&mut self, site_id: u64, batch_seq: u64, last_seq: u64) {
        let cursor = self.cursors.entry(site_id).or_insert(ReplicationCursor {
            site_id,
            last_seq: 0,
            last_batch: 0,
        });
        cursor.last_seq = cursor.last_seq.max(last_seq);
        cursor.last_batch = cursor.last_batch.max(batch_seq);
        self.push(WalRecord::Delivered {
            site_id,
            batch_seq,
            last_seq,
        });
    }

    /// Outbound cursor for a site; zeroed if unknown.
    pub fn cursor(&self, site_id: u64) -> ReplicationCursor {
        self.cursors
            .get(&site_id)
            .cloned()
            .unwrap_or(ReplicationCursor {
                site_id,
                last_seq: 0,
                last_batch: 0,
            })
    }

    /// All outbound cursors, by site.
    pub fn all_cursors(&self) -> Vec<ReplicationCursor> {
        let mut cursors: Vec<_> = self.cursors.values().cloned().collect();
        cursors.sort_by_key(|c| c.site_id);
        cursors
    }

    /// Inbound marks for a source site.
    pub fn mark(&self, source_site_id: u64) -> ReceiveMark {
        self.marks.get(&source_site_id).copied().unwrap_or_default()
    }

    /// Compares a source's journal epoch with the one its marks belong to.
    ///
    /// A newer epoch means the source started a new journal whose sequences
    /// begin again at 1, so its marks start over. `Less` means the epoch is
    /// older than the marks and its entries are stale.
    pub fn observe_epoch(&mut self, source_site_id: u64, epoch: u64) -> Ordering {
        let current = self.mark(source_site_id).epoch;
        let order = epoch.cmp(&current);
        if order == Ordering::Greater {
            self.marks.insert(
                source_site_id,
                ReceiveMark {
                    epoch,
                    ..ReceiveMark::default()
                },
            );
            self.unprocessed.remove(&source_site_id);
        }
        order
    }

    /// True if the batch was already processed.
    pub fn is_replayed_batch(&self, source_site_id: u64, batch_seq: u64) -> bool {
        batch_seq <= self.mark(source_site_id).batch_seq
    }

    /// True if the entry was already applied or skipped.
    pub fn is_replayed_entry(&self, source_site_id: u64, entry_seq: u64) -> bool {
        entry_seq <= self.mark(source_site_id).entry_seq
            && !self
                .unprocessed
                .get(&source_site_id)
                .is_some_and(|seqs| seqs.contains(&entry_seq))
    }

    /// Advances the entry mark after one entry was handled.
    pub fn record_entry(&mut self, source_site_id: u64, entry_seq: u64) {
        let mark = self.marks.entry(source_site_id).or_default();
        mark.entry_seq = mark.entry_seq.max(entry_seq);
        if let Some(seqs) = self.unprocessed.get_mut(&source_site_id) {
            seqs.remove(&entry_seq);
            if seqs.is_empty() {
                self.unprocessed.remove(&source_site_id);
            }
        }
    }

    /// Remembers entries a failed batch never applied, so a later mark
    /// from another batch does not turn their retransmit into a replay.
    pub fn record_unprocessed(
        &mut self,
        source_site_id: u64,
        entry_seqs: impl IntoIterator<Item = u64>,
    ) {
        let entry_mark = self.mark(source_site_id).entry_seq;
        let unprocessed = self.unprocessed.entry(source_site_id).or_default();
        for seq in entry_seqs {
            if seq > entry_mark || unprocessed.contains(&seq) {
                unprocessed.insert(seq);
            }
        }
        if unprocessed.is_empty() {
            self.unprocessed.remove(&source_site_id);
        }
    }

    /// Entry sequences from a source still waiting for a retransmit.
    pub fn unprocessed(&self, source_site_id: u64) -> Vec<u64> {
        self.unprocessed
            .get(&source_site_id)
            .map(|seqs| seqs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Advances the batch mark once every entry of the batch was handled.
    pub fn record_batch(&mut self, source_site_id: u64, batch_seq: u64) {
        let mark = self.marks.entry(source_site_id).or_default();
        mark.batch_seq = mark.batch_seq.max(batch_seq);
        let (epoch, entry_seq) = (mark.epoch, mark.entry_seq);
        self.push(WalRecord::Received {
            site_id: source_site_id,
            epoch,
            batch_seq,
            entry_seq,
        });
    }

    /// Forget all progress for a site (used when a site is removed or reset).
    pub fn reset(&mut self, site_id: u64) {
        self.cursors.remove(&site_id);
        self.marks.remove(&site_id);
        self.unprocessed.remove(&site_id);
    }

    /// Returns the WAL history (most recent last).
    pub fn history(&self) -> &[WalRecord] {
        &self.history
    }
}
