#![warn(missing_docs)]

//! ClaudeFS metadata subsystem: sharded Raft consensus, the metadata state
//! machine, cache coherence and the committed-entry journal

pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod directory;
pub mod group;
pub mod inode;
pub mod journal;
pub mod kvstore;
pub mod lease;
pub mod multiraft;
pub mod node;
pub mod pathres;
pub mod raft_log;
pub mod service;
pub mod shard;
pub mod snapshot;
pub mod state_machine;
pub mod transport;
pub mod types;
pub mod wire;
pub mod xattr;

pub use group::{ApplyObserver, GroupConfig, GroupStatus, ShardGroup};
pub use multiraft::MultiRaftManager;
pub use node::MetadataNode;
pub use service::{MetadataService, MetadataServiceConfig, SiteAccess};
pub use state_machine::{ApplyOutcome, ApplyStatus, MetaStateMachine};
pub use types::*;
