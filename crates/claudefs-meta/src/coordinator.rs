//! Cache coherence between committed metadata and client-side caches.
//!
//! Runs inside the apply path: every applied entry revokes the leases of the
//! inodes it touched and drops the path-cache entries for the names it
//! touched, before the proposer gets its reply.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::group::ApplyObserver;
use crate::lease::LeaseManager;
use crate::pathres::PathResolver;
use crate::state_machine::ApplyOutcome;
use crate::types::*;

/// Operational events emitted by the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoherenceEvent {
    /// Leases on an inode were revoked because it changed.
    LeaseRevoked {
        /// Changed inode
        ino: InodeId,
        /// Clients that held a lease
        clients: Vec<NodeId>,
    },
    /// A cached name binding was dropped.
    PathInvalidated {
        /// Directory holding the name
        parent: InodeId,
        /// The name
        name: String,
    },
}

/// Keeps leases and the path cache consistent with applied entries.
pub struct Coordinator {
    leases: Arc<LeaseManager>,
    paths: Arc<PathResolver>,
    events: broadcast::Sender<CoherenceEvent>,
}

impl Coordinator {
    /// Creates a coordinator over the given lease table and path cache.
    pub fn new(leases: Arc<LeaseManager>, paths: Arc<PathResolver>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            leases,
            paths,
            events,
        }
    }

    /// Subscribes to coherence events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoherenceEvent> {
        self.events.subscribe()
    }

    /// The lease table.
    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// The path cache.
    pub fn paths(&self) -> &Arc<PathResolver> {
        &self.paths
    }

    fn emit(&self, event: CoherenceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Revokes and invalidates everything an applied entry touched.
    pub fn on_applied(&self, outcome: &ApplyOutcome) {
        if !outcome.is_applied() {
            return;
        }
        for ino in &outcome.affected_inodes {
            let revoked = self.leases.revoke(*ino);
            if revoked.is_empty() {
                continue;
            }
            let clients: Vec<NodeId> = revoked.iter().map(|l| l.client).collect();
            tracing::debug!(
                ino = %ino,
                index = %outcome.index,
                clients = clients.len(),
                "revoked leases on changed inode"
            );
            self.emit(CoherenceEvent::LeaseRevoked { ino: *ino, clients });
        }
        for (parent, name) in &outcome.affected_names {
            if self.paths.invalidate_entry(*parent, name) {
                self.emit(CoherenceEvent::PathInvalidated {
                    parent: *parent,
                    name: name.clone(),
                });
            }
        }
        for ino in &outcome.deleted_inodes {
            self.paths.invalidate_inode(*ino);
        }
    }
}

impl ApplyObserver for Coordinator {
    fn on_applied(&self, _shard_id: ShardId, _entry: &LogEntry, outcome: &ApplyOutcome) {
        Coordinator::on_applied(self, outcome);
    }
}
