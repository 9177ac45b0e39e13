//! Operational events published by the replicator and the failover coordinator.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::failover::SiteMode;

/// Events for monitoring and management tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplEvent {
    /// Site promoted to a new mode.
    SitePromoted {
        /// Site identifier.
        site_id: u64,
        /// New site mode.
        new_mode: SiteMode,
    },
    /// Site demoted to a new mode.
    SiteDemoted {
        /// Site identifier.
        site_id: u64,
        /// New site mode.
        new_mode: SiteMode,
        /// Reason for demotion.
        reason: String,
    },
    /// Site recovered and is now fully active.
    SiteRecovered {
        /// Site identifier.
        site_id: u64,
    },
    /// Conflict detected that requires resolution.
    ConflictRequiresResolution {
        /// Site the conflicting write came from.
        site_id: u64,
        /// Inode with conflict.
        inode: u64,
        /// Alert carrying both versions.
        alert_id: u64,
    },
    /// Unsent batches were dropped from a full outbox.
    BatchesShed {
        /// Destination site.
        site_id: u64,
        /// Batches dropped.
        count: u64,
        /// Sequence of the newest dropped batch.
        last_batch_seq: u64,
    },
    /// A batch failed authentication.
    BatchRejected {
        /// Site the batch claimed to come from.
        source_site_id: u64,
        /// Sequence of the rejected batch.
        batch_seq: u64,
    },
}

/// Fan-out of [`ReplEvent`]s; sends never block and are dropped without subscribers.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ReplEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes one event.
    pub fn publish(&self, event: ReplEvent) {
        tracing::debug!(?event, "replication event");
        let _ = self.sender.send(event);
    }

    /// New subscriber receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
