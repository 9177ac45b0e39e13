//! Metadata server configuration, loaded from TOML or JSON.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consensus::RaftConfig;
use crate::pathres::PathCacheConfig;
use crate::service::MetadataServiceConfig;
use crate::shard::RetryPolicy;
use crate::snapshot::SnapshotPolicy;
use crate::types::NodeId;

/// Another metadata server of the local site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node id.
    pub node_id: u64,
    /// `host:port` of the peer's Raft listener.
    pub addr: String,
}

/// Configuration of one `cfs-meta` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// This node's id.
    pub node_id: u64,
    /// Site this node belongs to.
    pub site_id: u64,
    /// Address the Raft listener binds to.
    pub bind_addr: String,
    /// Other metadata servers of the site.
    pub peers: Vec<PeerConfig>,
    /// Number of virtual shards.
    pub num_shards: u16,
    /// Replicas per shard.
    pub replication_factor: usize,
    /// Length of one Raft tick.
    pub tick_interval_ms: u64,
    /// Lower bound of the election timeout, in ticks.
    pub election_timeout_min_ticks: u64,
    /// Upper bound of the election timeout, in ticks.
    pub election_timeout_max_ticks: u64,
    /// Heartbeat period, in ticks.
    pub heartbeat_interval_ticks: u64,
    /// Applied entries between snapshots.
    pub snapshot_threshold: u64,
    /// Entries kept behind each snapshot.
    pub snapshot_trailing: u64,
    /// How long a proposal may wait for commit.
    pub proposal_timeout_ms: u64,
    /// Lease lifetime.
    pub lease_duration_secs: u64,
    /// Positive path cache capacity.
    pub path_cache_entries: usize,
    /// Negative path cache capacity.
    pub negative_cache_entries: usize,
    /// Negative path cache TTL.
    pub negative_cache_ttl_secs: u64,
    /// Journal retention.
    pub journal_max_entries: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            site_id: 1,
            bind_addr: "0.0.0.0:9400".to_string(),
            peers: Vec::new(),
            num_shards: 256,
            replication_factor: 3,
            tick_interval_ms: 10,
            election_timeout_min_ticks: 15,
            election_timeout_max_ticks: 30,
            heartbeat_interval_ticks: 5,
            snapshot_threshold: 10_000,
            snapshot_trailing: 1_000,
            proposal_timeout_ms: 5_000,
            lease_duration_secs: 30,
            path_cache_entries: 65_536,
            negative_cache_entries: 16_384,
            negative_cache_ttl_secs: 5,
            journal_max_entries: 100_000,
        }
    }
}

impl MetaConfig {
    /// Loads a config file; the format is chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MetaConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the cluster cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_shards == 0 {
            anyhow::bail!("num_shards must be at least 1");
        }
        if self.replication_factor == 0 || self.replication_factor > self.peers.len() + 1 {
            anyhow::bail!(
                "replication_factor {} needs between 1 and {} nodes",
                self.replication_factor,
                self.peers.len() + 1
            );
        }
        if self.election_timeout_min_ticks > self.election_timeout_max_ticks {
            anyhow::bail!("election timeout range is empty");
        }
        if self.heartbeat_interval_ticks >= self.election_timeout_min_ticks {
            anyhow::bail!("heartbeat interval must be shorter than the election timeout");
        }
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            anyhow::bail!("node {} lists itself as a peer", self.node_id);
        }
        Ok(())
    }

    /// Every node of the site, ascending.
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .peers
            .iter()
            .map(|p| NodeId::new(p.node_id))
            .chain(std::iter::once(NodeId::new(self.node_id)))
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    /// Peer addresses keyed by node id.
    pub fn peer_addrs(&self) -> HashMap<NodeId, String> {
        self.peers
            .iter()
            .map(|p| (NodeId::new(p.node_id), p.addr.clone()))
            .collect()
    }

    /// Settings for the metadata service.
    pub fn service_config(&self) -> MetadataServiceConfig {
        MetadataServiceConfig {
            node_id: NodeId::new(self.node_id),
            site_id: self.site_id,
            num_shards: self.num_shards,
            raft: RaftConfig {
                election_timeout_min_ticks: self.election_timeout_min_ticks,
                election_timeout_max_ticks: self.election_timeout_max_ticks,
                heartbeat_interval_ticks: self.heartbeat_interval_ticks,
                ..RaftConfig::default()
            },
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            proposal_timeout: Duration::from_millis(self.proposal_timeout_ms),
            snapshot: SnapshotPolicy {
                threshold: self.snapshot_threshold,
                trailing: self.snapshot_trailing,
            },
            channel_capacity: 1024,
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            path_cache: PathCacheConfig {
                max_entries: self.path_cache_entries,
                max_negative_entries: self.negative_cache_entries,
                negative_ttl: Duration::from_secs(self.negative_cache_ttl_secs),
            },
            max_journal_entries: self.journal_max_entries,
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MetaConfig::default();
        assert_eq!(config.num_shards, 256);
        assert_eq!(config.replication_factor, 3);
        assert!(config.peers.is_empty());
        // a lone default node cannot host three replicas
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
node_id = 2
site_id = 7
bind_addr = "10.0.0.2:9400"
num_shards = 16
replication_factor = 3
snapshot_threshold = 500

[[peers]]
node_id = 1
addr = "10.0.0.1:9400"

[[peers]]
node_id = 3
addr = "10.0.0.3:9400"
            "#
        )
        .unwrap();

        let config = MetaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.site_id, 7);
        assert_eq!(config.num_shards, 16);
        assert_eq!(config.tick_interval_ms, 10);
        assert_eq!(
            config.cluster_nodes(),
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
        );
        assert_eq!(
            config.peer_addrs().get(&NodeId::new(3)).map(String::as_str),
            Some("10.0.0.3:9400")
        );

        let service = config.service_config();
        assert_eq!(service.snapshot.threshold, 500);
        assert_eq!(service.node_id, NodeId::new(2));
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "node_id": 1,
                "replication_factor": 1,
                "num_shards": 4,
                "proposal_timeout_ms": 250
            }}"#
        )
        .unwrap();

        let config = MetaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.num_shards, 4);
        assert_eq!(
            config.service_config().proposal_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_rejects_unknown_extension_and_bad_timing() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(MetaConfig::from_file(file.path()).is_err());

        let config = MetaConfig {
            replication_factor: 1,
            heartbeat_interval_ticks: 20,
            ..MetaConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
