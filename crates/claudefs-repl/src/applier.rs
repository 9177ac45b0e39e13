//! Seam between the replicator and the local metadata store.
//!
//! The replicator only reads inode clocks and hands accepted remote writes to
//! a [`LocalApplier`]. In a running site the writes go through the local
//! metadata service, so the state machine stays the only mutator of the
//! tables; tests can apply straight to state machines.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use claudefs_meta::shard::ShardRouter;
use claudefs_meta::{
    ApplyOutcome, InodeAttr, InodeId, LogEntry, MetaError, MetaOp, MetaStateMachine,
    MetadataService, ShardId, Term,
};
use tokio::sync::Mutex;

use crate::conflict_resolver::LocalVersion;
use crate::error::ReplError;
use crate::journal::ReplicatedEntry;

/// Local side of replication.
#[async_trait]
pub trait LocalApplier: Send + Sync {
    /// Current version of `ino`, `None` if the inode does not exist locally.
    fn clock_of(&self, ino: InodeId) -> Result<Option<LocalVersion>, ReplError>;

    /// Commits a remote write locally with its origin clock.
    async fn apply(&self, entry: &ReplicatedEntry, conflict: bool) -> Result<ApplyOutcome, ReplError>;
}

/// Wraps a remote entry's operation for local commit.
pub fn replicated_op(entry: &ReplicatedEntry, conflict: bool) -> MetaOp {
    MetaOp::Replicated {
        origin: entry.clock,
        timestamp: entry.committed_at,
        conflict,
        op: Box::new(entry.entry.op.clone()),
    }
}

fn version_of(attr: Result<InodeAttr, MetaError>) -> Result<Option<LocalVersion>, ReplError> {
    match attr {
        Ok(attr) => Ok(Some(LocalVersion {
            clock: attr.vector_clock,
            timestamp: attr.ctime,
        })),
        Err(MetaError::InodeNotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Applies remote writes by proposing them through the local metadata service.
pub struct ServiceApplier {
    service: Arc<MetadataService>,
}

impl ServiceApplier {
    /// Creates an applier for `service`.
    pub fn new(service: Arc<MetadataService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl LocalApplier for ServiceApplier {
    fn clock_of(&self, ino: InodeId) -> Result<Option<LocalVersion>, ReplError> {
        version_of(self.service.getattr(ino))
    }

    async fn apply(&self, entry: &ReplicatedEntry, conflict: bool) -> Result<ApplyOutcome, ReplError> {
        Ok(self
            .service
            .apply_replicated(replicated_op(entry, conflict))
            .await?)
    }
}

/// Applies remote writes directly to state machines, one per shard.
///
/// Entries get the next local log position; there is no consensus round.
pub struct StateMachineApplier {
    router: ShardRouter,
    shards: HashMap<ShardId, Arc<MetaStateMachine>>,
    apply_lock: Mutex<()>,
}

impl StateMachineApplier {
    /// Creates an applier over the state machines of a `num_shards` layout.
    pub fn new(num_shards: u16, machines: impl IntoIterator<Item = Arc<MetaStateMachine>>) -> Self {
        Self {
            router: ShardRouter::new(num_shards),
            shards: machines.into_iter().map(|sm| (sm.shard_id(), sm)).collect(),
            apply_lock: Mutex::new(()),
        }
    }

    fn machine(&self, ino: InodeId) -> Result<&Arc<MetaStateMachine>, ReplError> {
        let shard_id = self.router.route(ino);
        self.shards
            .get(&shard_id)
            .ok_or(ReplError::Meta(MetaError::ShardNotFound(shard_id)))
    }
}

#[async_trait]
impl LocalApplier for StateMachineApplier {
    fn clock_of(&self, ino: InodeId) -> Result<Option<LocalVersion>, ReplError> {
        version_of(self.machine(ino)?.get_attr(ino))
    }

    async fn apply(&self, entry: &ReplicatedEntry, conflict: bool) -> Result<ApplyOutcome, ReplError> {
        let ino = entry
            .inode()
            .ok_or_else(|| ReplError::Codec("replicated entry without target inode".to_string()))?;
        let sm = self.machine(ino)?;
        let op = replicated_op(entry, conflict);
        let _guard = self.apply_lock.lock().await;
        sm.validate(&op)?;
        let log_entry = LogEntry {
            index: sm.last_applied().next(),
            term: sm.last_applied_term().max(Term::new(1)),
            op,
        };
        Ok(sm.apply(&log_entry)?.into_result()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claudefs_meta::kvstore::MemoryKvStore;
    use claudefs_meta::service::MetadataServiceConfig;
    use claudefs_meta::state_machine::StateMachineConfig;
    use claudefs_meta::transport::InMemoryNetwork;
    use claudefs_meta::{LogIndex, NodeId, Timestamp, VectorClock};
    use std::time::Duration;

    fn machine(site_id: u64) -> Arc<MetaStateMachine> {
        Arc::new(
            MetaStateMachine::open(
                Arc::new(MemoryKvStore::new()),
                StateMachineConfig {
                    site_id,
                    shard_id: ShardId::new(0),
                    num_shards: 1,
                },
            )
            .unwrap(),
        )
    }

    fn create(ino: u64, clock: VectorClock) -> ReplicatedEntry {
        let mut attr = InodeAttr::new_file(InodeId::new(ino), 0, 0, 0o644);
        attr.ctime = Timestamp::new(50, 0);
        ReplicatedEntry {
            epoch: 1,
            sequence: clock.sequence,
            shard_id: ShardId::new(0),
            committed_at: Timestamp::new(50, 0),
            clock,
            base_clock: None,
            entry: LogEntry {
                index: LogIndex::new(clock.sequence),
                term: Term::new(3),
                op: MetaOp::CreateInode { attr },
            },
        }
    }

    #[tokio::test]
    async fn test_state_machine_applier_stamps_origin_clock() {
        let sm = machine(2);
        let applier = StateMachineApplier::new(1, [sm.clone()]);
        assert_eq!(applier.clock_of(InodeId::new(7)).unwrap(), None);

        let outcome = applier.apply(&create(7, VectorClock::new(1, 40)), false).await.unwrap();
        assert_eq!(outcome.index, LogIndex::new(1));
        assert_eq!(sm.last_applied(), LogIndex::new(1));

        let version = applier.clock_of(InodeId::new(7)).unwrap().unwrap();
        assert_eq!(version.clock, VectorClock::new(1, 40));
        assert_eq!(version.timestamp, Timestamp::new(50, 0));
    }

    #[tokio::test]
    async fn test_state_machine_applier_rejects_without_mutation() {
        let sm = machine(2);
        let applier = StateMachineApplier::new(1, [sm.clone()]);
        applier.apply(&create(7, VectorClock::new(1, 40)), false).await.unwrap();
        let before = sm.fingerprint().unwrap();

        let err = applier
            .apply(&create(7, VectorClock::new(1, 41)), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::Meta(MetaError::InodeExists(_))));
        assert_eq!(sm.fingerprint().unwrap(), before);
        assert_eq!(sm.last_applied(), LogIndex::new(1));
    }

    #[tokio::test]
    async fn test_service_applier_goes_through_consensus() {
        let network = InMemoryNetwork::new();
        let (transport, _rx) = network.register(NodeId::new(1), 16);
        let service = Arc::new(MetadataService::new(
            MetadataServiceConfig {
                site_id: 2,
                num_shards: 1,
                tick_interval: Duration::from_millis(2),
                ..MetadataServiceConfig::default()
            },
            transport,
        ));
        service
            .start_shard(ShardId::new(0), vec![], Arc::new(MemoryKvStore::new()))
            .unwrap();
        service.bootstrap_root().await.unwrap();

        let applier = ServiceApplier::new(service.clone());
        applier.apply(&create(9, VectorClock::new(1, 12)), false).await.unwrap();
        let version = applier.clock_of(InodeId::new(9)).unwrap().unwrap();
        assert_eq!(version.clock, VectorClock::new(1, 12));

        // standby sites still accept replicated writes
        service.set_site_access(claudefs_meta::SiteAccess::ReadOnly);
        applier.apply(&create(10, VectorClock::new(1, 13)), false).await.unwrap();

        service.set_site_access(claudefs_meta::SiteAccess::Offline);
        assert!(applier.clock_of(InodeId::new(9)).is_err());
        service.shutdown().await;
    }
}
