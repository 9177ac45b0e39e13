//! Two-site replication harness.
//!
//! Each `TestSite` is a single-node metadata service with one shard plus a
//! replication engine applying through it. Batches can be shipped by hand
//! (deterministic) or by the engine's site tasks over an in-memory conduit.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use claudefs_meta::kvstore::MemoryKvStore;
use claudefs_meta::service::MetadataServiceConfig;
use claudefs_meta::transport::InMemoryNetwork;
use claudefs_meta::types::*;
use claudefs_meta::MetadataService;
use claudefs_repl::applier::ServiceApplier;
use claudefs_repl::batch_auth::BatchAuthKey;
use claudefs_repl::conduit::{BatchEnvelope, Conduit, InMemoryConduit};
use claudefs_repl::journal::{JournalTailer, ReplicatedEntry};
use claudefs_repl::{BatchReport, EngineConfig, EventBus, ReplError, ReplicationEngine};

pub const KEY: [u8; 32] = [0x5a; 32];
pub const SHARD: ShardId = ShardId::new(0);

pub struct TestSite {
    pub site_id: u64,
    pub service: Arc<MetadataService>,
    pub engine: ReplicationEngine,
    pub events: EventBus,
}

impl TestSite {
    /// Starts a site; only a bootstrapped site creates its own root.
    pub async fn start(site_id: u64, bootstrap: bool, config: EngineConfig) -> Self {
        let network = InMemoryNetwork::new();
        let (transport, _rx) = network.register(NodeId::new(1), 16);
        let service = Arc::new(MetadataService::new(
            MetadataServiceConfig {
                site_id,
                num_shards: 1,
                tick_interval: Duration::from_millis(2),
                ..MetadataServiceConfig::default()
            },
            transport,
        ));
        service
            .start_shard(SHARD, vec![], Arc::new(MemoryKvStore::new()))
            .unwrap();
        if bootstrap {
            service.bootstrap_root().await.unwrap();
        } else {
            service
                .raft()
                .group(SHARD)
                .unwrap()
                .wait_for_leader(Duration::from_secs(5))
                .await
                .unwrap();
        }
        let events = EventBus::default();
        let engine = ReplicationEngine::new(
            EngineConfig {
                local_site_id: site_id,
                ..config
            },
            BatchAuthKey::from_bytes(KEY),
            Arc::new(ServiceApplier::new(service.clone())),
            events.clone(),
        );
        Self {
            site_id,
            service,
            engine,
            events,
        }
    }

    /// Digest of every table of the site's shard.
    pub fn fingerprint(&self) -> [u8; 32] {
        self.service
            .raft()
            .state_machine(SHARD)
            .unwrap()
            .fingerprint()
            .unwrap()
    }

    /// Latest local journal sequence.
    pub fn journal_position(&self) -> u64 {
        self.service.journal().latest_sequence().unwrap()
    }

    /// Locally originated entries after journal sequence `after`.
    pub fn local_entries(&self, after: u64) -> Vec<ReplicatedEntry> {
        JournalTailer::new(self.service.journal().clone(), after)
            .poll(10_000)
            .unwrap()
    }

    /// Signs this site's entries after `after` as batch `batch_seq`.
    pub fn batch(&self, after: u64, batch_seq: u64) -> BatchEnvelope {
        self.engine
            .build_batch(batch_seq, self.local_entries(after))
            .unwrap()
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.service.shutdown().await;
    }
}

/// Two sites that know each other. Site 1 owns the root.
pub async fn two_sites(config: EngineConfig) -> (TestSite, TestSite) {
    let a = TestSite::start(1, true, config.clone()).await;
    let b = TestSite::start(2, false, config).await;
    a.engine.add_site(2).await;
    b.engine.add_site(1).await;
    (a, b)
}

/// Ships `from`'s entries after `after` to `to` as batch `batch_seq`.
pub async fn ship(
    from: &TestSite,
    to: &TestSite,
    after: u64,
    batch_seq: u64,
) -> (Bytes, Result<BatchReport, ReplError>) {
    let frame = from.batch(after, batch_seq).encode().unwrap();
    let report = to.engine.receive_batch(&frame).await;
    (frame, report)
}

/// Connects the two sites' engines over an in-memory conduit and starts their tasks.
pub async fn connect(a: &TestSite, b: &TestSite) -> (Arc<InMemoryConduit>, Arc<InMemoryConduit>) {
    let (ca, cb) = InMemoryConduit::pair(a.site_id, b.site_id, 64);
    let (ca, cb) = (Arc::new(ca), Arc::new(cb));
    a.engine
        .start_site(ca.clone() as Arc<dyn Conduit>, a.service.journal().clone())
        .await;
    b.engine
        .start_site(cb.clone() as Arc<dyn Conduit>, b.service.journal().clone())
        .await;
    (ca, cb)
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
