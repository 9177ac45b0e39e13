//! Conflict detection and resolution for cross-site replication.
//!
//! A remote entry is compared against the local inode's clock. Writes that
//! follow each other causally apply or skip silently; concurrent writes are
//! settled by last-write-wins on the commit timestamp, and every such
//! detection leaves exactly one [`ConflictAlert`] with both versions.

use std::cmp::Ordering;
use std::collections::VecDeque;

use claudefs_meta::{InodeId, Timestamp, VectorClock};
use serde::{Deserialize, Serialize};

use crate::journal::ReplicatedEntry;

/// Clock and change time of the local copy of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVersion {
    /// Clock of the last write applied locally.
    pub clock: VectorClock,
    /// Change time of that write.
    pub timestamp: Timestamp,
}

/// How a remote write relates to the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The local copy already is this write.
    Duplicate,
    /// The remote write supersedes the local copy.
    RemoteDominates,
    /// An older write from the same origin.
    Stale,
    /// Neither write has seen the other.
    Concurrent,
}

/// Relates a remote write (`remote`, written on top of `base`) to the local clock.
pub fn classify(
    local: Option<VectorClock>,
    remote: VectorClock,
    base: Option<VectorClock>,
) -> Classification {
    let Some(local) = local else {
        return Classification::RemoteDominates;
    };
    if local == remote {
        return Classification::Duplicate;
    }
    if base == Some(local) {
        return Classification::RemoteDominates;
    }
    if local.site_id == remote.site_id {
        return if remote.sequence > local.sequence {
            Classification::RemoteDominates
        } else {
            Classification::Stale
        };
    }
    Classification::Concurrent
}

/// Which version survives a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    /// The local copy is kept.
    Local,
    /// The remote write is applied.
    Remote,
}

/// Last-write-wins: later timestamp wins, equal timestamps fall back to clock order.
pub fn last_writer(local: &LocalVersion, remote_clock: VectorClock, remote_ts: Timestamp) -> Winner {
    match remote_ts
        .cmp(&local.timestamp)
        .then_with(|| remote_clock.cmp(&local.clock))
    {
        Ordering::Greater => Winner::Remote,
        _ => Winner::Local,
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Site that produced the version.
    pub site_id: u64,
    /// Clock of the version.
    pub clock: VectorClock,
    /// Change time of the version.
    pub timestamp: Timestamp,
}

/// Why an alert was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertReason {
    /// Both sites wrote the inode without seeing each other's write.
    ConcurrentWrite,
    /// The remote write no longer validates locally and was not applied.
    RemoteRejected {
        /// Validation failure reported by the local state machine.
        reason: String,
    },
}

/// A conflict that operators may want to review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictAlert {
    /// Unique identifier for this alert.
    pub alert_id: u64,
    /// The inode that had the conflict.
    pub inode: InodeId,
    /// Site the remote write came from.
    pub source_site_id: u64,
    /// Local version at detection time, if the inode existed.
    pub local: Option<VersionInfo>,
    /// The remote version.
    pub remote: VersionInfo,
    /// Operation carried by the remote write.
    pub remote_op: String,
    /// Surviving version.
    pub winner: Winner,
    /// What was detected.
    pub reason: AlertReason,
}

/// What to do with one remote entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Already applied; nothing to do.
    Duplicate,
    /// Older than the local copy; nothing to do.
    Stale,
    /// Apply the remote write.
    Apply,
    /// Apply the remote write, which won a conflict.
    ApplyConflict {
        /// Alert recorded for the conflict.
        alert_id: u64,
    },
    /// Keep the local copy, which won a conflict.
    KeepLocal {
        /// Alert recorded for the conflict.
        alert_id: u64,
    },
}

/// Conflict resolver implementing last-write-wins (LWW) semantics.
#[derive(Debug)]
pub struct ConflictResolver {
    alerts: VecDeque<ConflictAlert>,
    max_alerts: usize,
    next_id: u64,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl ConflictResolver {
    /// Creates a resolver retaining at most `max_alerts` alerts.
    pub fn new(max_alerts: usize) -> Self {
        Self {
            alerts: VecDeque::new(),
            max_alerts: max_alerts.max(1),
            next_id: 1,
        }
    }

    fn push(&mut self, mut alert: ConflictAlert) -> u64 {
        let alert_id = self.next_id;
        self.next_id += 1;
        alert.alert_id = alert_id;
        self.alerts.push_back(alert);
        while self.alerts.len() > self.max_alerts {
            self.alerts.pop_front();
        }
        alert_id
    }

    fn remote_version(entry: &ReplicatedEntry) -> VersionInfo {
        VersionInfo {
            site_id: entry.clock.site_id,
            clock: entry.clock,
            timestamp: entry.committed_at,
        }
    }

    fn local_version(local: &LocalVersion) -> VersionInfo {
        VersionInfo {
            site_id: local.clock.site_id,
            clock: local.clock,
            timestamp: local.timestamp,
        }
    }

    /// Decides how a remote entry lands on inode `ino`, recording an alert
    /// when the writes were concurrent.
    pub fn resolve(
        &mut self,
        source_site_id: u64,
        ino: InodeId,
        local: Option<LocalVersion>,
        entry: &ReplicatedEntry,
    ) -> Decision {
        match classify(local.map(|l| l.clock), entry.clock, entry.base_clock) {
            Classification::Duplicate => Decision::Duplicate,
            Classification::Stale => Decision::Stale,
            Classification::RemoteDominates => Decision::Apply,
            Classification::Concurrent => {
                // Concurrent implies a local version exists.
                let Some(local) = local else {
                    return Decision::Apply;
                };
                let winner = last_writer(&local, entry.clock, entry.committed_at);
                let alert_id = self.push(ConflictAlert {
                    alert_id: 0,
                    inode: ino,
                    source_site_id,
                    local: Some(Self::local_version(&local)),
                    remote: Self::remote_version(entry),
                    remote_op: entry.entry.op.kind().to_string(),
                    winner,
                    reason: AlertReason::ConcurrentWrite,
                });
                tracing::warn!(
                    site_id = source_site_id,
                    ino = %ino,
                    local_clock = %local.clock,
                    remote_clock = %entry.clock,
                    local_ts = %local.timestamp,
                    remote_ts = %entry.committed_at,
                    ?winner,
                    "concurrent write conflict resolved by last-write-wins"
                );
                match winner {
                    Winner::Remote => Decision::ApplyConflict { alert_id },
                    Winner::Local => Decision::KeepLocal { alert_id },
                }
            }
        }
    }

    /// Records that a remote write failed local validation.
    ///
    /// If `existing` names the alert of the same detection, that alert is
    /// updated instead of raising a second one. Returns the alert id and
    /// whether a new alert was created.
    pub fn record_rejection(
        &mut self,
        source_site_id: u64,
        ino: InodeId,
        local: Option<LocalVersion>,
        entry: &ReplicatedEntry,
        reason: String,
        existing: Option<u64>,
    ) -> (u64, bool) {
        tracing::warn!(
            site_id = source_site_id,
            ino = %ino,
            op = entry.entry.op.kind(),
            reason = %reason,
            "remote write rejected by local state"
        );
        if let Some(alert_id) = existing {
            if let Some(alert) = self.alerts.iter_mut().find(|a| a.alert_id == alert_id) {
                alert.winner = Winner::Local;
                alert.reason = AlertReason::RemoteRejected { reason };
                return (alert_id, false);
            }
        }
        let alert_id = self.push(ConflictAlert {
            alert_id: 0,
            inode: ino,
            source_site_id,
            local: local.as_ref().map(Self::local_version),
            remote: Self::remote_version(entry),
            remote_op: entry.entry.op.kind().to_string(),
            winner: Winner::Local,
            reason: AlertReason::RemoteRejected { reason },
        });
        (alert_id, true)
    }

    /// Retained alerts, oldest first.
    pub fn alerts(&self) -> Vec<ConflictAlert> {
        self.alerts.iter().cloned().collect()
    }

    /// Alerts for one inode.
    pub fn alerts_for(&self, ino: InodeId) -> Vec<ConflictAlert> {
        self.alerts.iter().filter(|a| a.inode == ino).cloned().collect()
    }

    /// Total alerts ever raised.
    pub fn alert_count(&self) -> u64 {
        self.next_id - 1
    }
}
