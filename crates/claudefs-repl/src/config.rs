//! Replication configuration, loaded from TOML or JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch_auth::BatchAuthKey;
use crate::conduit::ConduitConfig;
use crate::engine::EngineConfig;
use crate::failover::FailoverConfig;
use crate::throttle::ThrottleConfig;

/// A remote site this site replicates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSiteConfig {
    /// Remote site id.
    pub site_id: u64,
    /// `host:port` of the remote replication listener.
    pub addr: String,
}

/// Configuration of one `cfs-repl` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Local site id; must match the metadata server's site.
    pub site_id: u64,
    /// Address the replication listener binds to.
    pub bind_addr: String,
    /// Sites to replicate with.
    pub sites: Vec<RemoteSiteConfig>,
    /// Pre-shared batch key, 64 hex characters.
    pub batch_key: String,
    /// Maximum entries per batch.
    pub max_batch_entries: usize,
    /// Unsent batches kept per site before the oldest is shed.
    pub outbox_capacity: usize,
    /// Pause after a failed send.
    pub retry_backoff_ms: u64,
    /// Conduit connect timeout.
    pub connect_timeout_ms: u64,
    /// Send limits per remote site.
    pub throttle: ThrottleConfig,
    /// Failover thresholds and check period.
    pub failover: FailoverConfig,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            site_id: 1,
            bind_addr: "0.0.0.0:9500".to_string(),
            sites: Vec::new(),
            batch_key: String::new(),
            max_batch_entries: 1000,
            outbox_capacity: 64,
            retry_backoff_ms: 500,
            connect_timeout_ms: 5000,
            throttle: ThrottleConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

impl ReplConfig {
    /// Loads a config file; the format is chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings replication cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.batch_key()?;
        if self.max_batch_entries == 0 {
            anyhow::bail!("max_batch_entries must be at least 1");
        }
        if self.outbox_capacity == 0 {
            anyhow::bail!("outbox_capacity must be at least 1");
        }
        if self.failover.failure_threshold == 0 || self.failover.recovery_threshold == 0 {
            anyhow::bail!("failover thresholds must be at least 1");
        }
        let mut ids: Vec<u64> = self.sites.iter().map(|s| s.site_id).collect();
        if ids.contains(&self.site_id) {
            anyhow::bail!("site {} lists itself as a remote site", self.site_id);
        }
        ids.sort_unstable();
        let count = ids.len();
        ids.dedup();
        if ids.len() != count {
            anyhow::bail!("remote site ids must be unique");
        }
        Ok(())
    }

    /// Decodes the pre-shared batch key.
    pub fn batch_key(&self) -> anyhow::Result<BatchAuthKey> {
        BatchAuthKey::from_hex(&self.batch_key)
            .map_err(|e| anyhow::anyhow!("invalid batch_key: {}", e))
    }

    /// Settings for the replication engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            local_site_id: self.site_id,
            max_batch_entries: self.max_batch_entries,
            outbox_capacity: self.outbox_capacity,
            throttle: self.throttle.clone(),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..EngineConfig::default()
        }
    }

    /// Settings for outbound TCP conduits.
    pub fn conduit_config(&self) -> ConduitConfig {
        ConduitConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            ..ConduitConfig::default()
        }
    }
}
