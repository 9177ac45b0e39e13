#![warn(missing_docs)]

//! ClaudeFS replication subsystem: cross-site journal replication, conflict resolution, site failover

pub mod applier;
pub mod audit;
pub mod batch_auth;
pub mod conduit;
pub mod config;
pub mod conflict_resolver;
pub mod engine;
pub mod error;
pub mod events;
pub mod failover;
pub mod journal;
pub mod outbox;
pub mod throttle;
pub mod wal;

pub use engine::{BatchReport, EngineConfig, ReplicationEngine, SiteReplicationStats};
pub use error::ReplError;
pub use events::{EventBus, ReplEvent};
pub use failover::{FailoverConfig, FailoverManager, SiteMode};
