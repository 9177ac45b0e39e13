//! High-level metadata service combining all subsystems.
//!
//! MetadataService is the primary entry point for metadata operations from
//! FUSE clients and protocol gateways. Every mutation becomes exactly one
//! proposal on the owning shard's consensus group (a `Transaction` when
//! several table changes must land together); reads are served from the
//! local replica's state machine. The service also owns the client-facing
//! caches (leases, path cache), the metadata journal, and the site access
//! mode set by the failover coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::consensus::RaftConfig;
use crate::coordinator::Coordinator;
use crate::group::{ApplyObserver, GroupConfig};
use crate::journal::MetadataJournal;
use crate::kvstore::KvStore;
use crate::lease::{Lease, LeaseManager, LeaseType};
use crate::multiraft::MultiRaftManager;
use crate::pathres::{PathCacheConfig, PathCacheEntry, PathResolver};
use crate::shard::{RetryPolicy, ShardRouter};
use crate::snapshot::SnapshotPolicy;
use crate::state_machine::{ApplyOutcome, MetaStateMachine};
use crate::transport::RaftTransport;
use crate::types::*;

/// Which operations the local site currently serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteAccess {
    /// Reads and writes.
    ReadWrite,
    /// Reads only; client writes fail with `ReadOnly`.
    ReadOnly,
    /// Nothing; every client call fails with `SiteOffline`.
    Offline,
}

/// Configuration for the metadata service.
#[derive(Clone, Debug)]
pub struct MetadataServiceConfig {
    /// This node's ID.
    pub node_id: NodeId,
    /// Site ID stamped into vector clocks.
    pub site_id: u64,
    /// Number of virtual shards.
    pub num_shards: u16,
    /// Raft timing shared by every group; node and shard are filled per group.
    pub raft: RaftConfig,
    /// Wall-clock length of one Raft tick.
    pub tick_interval: Duration,
    /// How long a proposal may wait for commit.
    pub proposal_timeout: Duration,
    /// Snapshot and compaction policy.
    pub snapshot: SnapshotPolicy,
    /// Per-group queue capacity.
    pub channel_capacity: usize,
    /// Lease lifetime.
    pub lease_duration: Duration,
    /// Path cache sizing.
    pub path_cache: PathCacheConfig,
    /// Journal retention.
    pub max_journal_entries: usize,
    /// Backoff while a shard has no leader.
    pub retry: RetryPolicy,
}

impl Default for MetadataServiceConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            site_id: 1,
            num_shards: 256,
            raft: RaftConfig::default(),
            tick_interval: Duration::from_millis(10),
            proposal_timeout: Duration::from_secs(5),
            snapshot: SnapshotPolicy::default(),
            channel_capacity: 1024,
            lease_duration: Duration::from_secs(30),
            path_cache: PathCacheConfig::default(),
            max_journal_entries: 100_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// The metadata service: primary entry point for all metadata operations.
pub struct MetadataService {
    config: MetadataServiceConfig,
    router: Arc<ShardRouter>,
    raft: Arc<MultiRaftManager>,
    coordinator: Arc<Coordinator>,
    journal: Arc<MetadataJournal>,
    access: watch::Sender<SiteAccess>,
    /// Last inode number handed out per shard.
    allocated: Mutex<HashMap<ShardId, u64>>,
    /// Open handle count per inode.
    open_handles: Mutex<HashMap<InodeId, u32>>,
}

impl MetadataService {
    /// Builds the service and its shard registry. No shard runs until
    /// [`start_shard`](Self::start_shard) is called.
    pub fn new(config: MetadataServiceConfig, transport: Arc<dyn RaftTransport>) -> Self {
        let router = Arc::new(ShardRouter::new(config.num_shards));
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(LeaseManager::new(config.lease_duration)),
            Arc::new(PathResolver::new(config.num_shards, config.path_cache.clone())),
            config.channel_capacity,
        ));
        let journal = Arc::new(MetadataJournal::new(config.max_journal_entries));
        let observers: Vec<Arc<dyn ApplyObserver>> = vec![coordinator.clone(), journal.clone()];
        let raft = Arc::new(MultiRaftManager::new(
            config.node_id,
            router.clone(),
            transport,
            observers,
        ));
        let (access, _) = watch::channel(SiteAccess::ReadWrite);
        Self {
            config,
            router,
            raft,
            coordinator,
            journal,
            access,
            allocated: Mutex::new(HashMap::new()),
            open_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the local replica of `shard_id` with the given peers.
    pub fn start_shard(
        &self,
        shard_id: ShardId,
        peers: Vec<NodeId>,
        kv: Arc<dyn KvStore>,
    ) -> Result<(), MetaError> {
        let mut replicas = vec![self.config.node_id];
        replicas.extend(peers.iter().copied());
        self.router.assign_shard(shard_id, replicas)?;

        let group = GroupConfig {
            raft: RaftConfig {
                node_id: self.config.node_id,
                shard_id,
                peers,
                ..self.config.raft.clone()
            },
            state_machine: crate::state_machine::StateMachineConfig {
                site_id: self.config.site_id,
                shard_id,
                num_shards: self.config.num_shards,
            },
            tick_interval: self.config.tick_interval,
            proposal_timeout: self.config.proposal_timeout,
            snapshot: self.config.snapshot.clone(),
            channel_capacity: self.config.channel_capacity,
        };
        self.raft.start_group(group, kv)
    }

    /// The shard registry.
    pub fn raft(&self) -> &Arc<MultiRaftManager> {
        &self.raft
    }

    /// The shard router.
    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// The lease and path-cache coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// The journal of committed entries.
    pub fn journal(&self) -> &Arc<MetadataJournal> {
        &self.journal
    }

    /// Number of virtual shards.
    pub fn num_shards(&self) -> u16 {
        self.config.num_shards
    }

    /// Site id of this service.
    pub fn site_id(&self) -> u64 {
        self.config.site_id
    }

    /// Current access mode.
    pub fn site_access(&self) -> SiteAccess {
        *self.access.borrow()
    }

    /// Watch for access mode changes.
    pub fn watch_site_access(&self) -> watch::Receiver<SiteAccess> {
        self.access.subscribe()
    }

    /// Changes the access mode.
    pub fn set_site_access(&self, access: SiteAccess) {
        let previous = self.access.send_replace(access);
        if previous != access {
            tracing::info!(
                node_id = %self.config.node_id,
                site_id = self.config.site_id,
                ?previous,
                ?access,
                "site access changed"
            );
        }
    }

    fn check_readable(&self) -> Result<(), MetaError> {
        match self.site_access() {
            SiteAccess::Offline => Err(MetaError::SiteOffline),
            _ => Ok(()),
        }
    }

    fn check_writable(&self) -> Result<(), MetaError> {
        match self.site_access() {
            SiteAccess::ReadWrite => Ok(()),
            SiteAccess::ReadOnly => Err(MetaError::ReadOnly),
            SiteAccess::Offline => Err(MetaError::SiteOffline),
        }
    }

    fn state_machine_for(&self, ino: InodeId) -> Result<Arc<MetaStateMachine>, MetaError> {
        self.raft.state_machine(self.router.route(ino))
    }

    /// Proposes on a shard, waiting out leaderless windows.
    ///
    /// Local operations are stamped with the current time, which becomes the
    /// change time of every inode they touch. Only `NotLeader` without a hint
    /// is retried: nothing was appended anywhere.
    async fn propose(&self, shard_id: ShardId, op: MetaOp) -> Result<ApplyOutcome, MetaError> {
        let op = op.stamped(Timestamp::now());
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            match self.raft.propose(shard_id, op.clone()).await {
                Err(MetaError::NotLeader { leader_hint: None })
                    if attempt + 1 < policy.max_attempts =>
                {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn allocate_inode(&self, shard_id: ShardId) -> Result<InodeId, MetaError> {
        let floor = self
            .raft
            .state_machine(shard_id)?
            .highest_inode()?
            .map(|i| i.as_u64())
            .unwrap_or(0);
        let mut allocated = self
            .allocated
            .lock()
            .map_err(|e| MetaError::KvError(format!("allocator poisoned: {}", e)))?;
        let last = allocated.entry(shard_id).or_insert(0);
        let base = (*last).max(floor);
        let n = self.config.num_shards.max(1) as u64;
        let mut next = base - base % n + shard_id.as_u16() as u64;
        if next <= base {
            next += n;
        }
        *last = next;
        Ok(InodeId::new(next))
    }

    /// Creates the root directory if it does not exist yet.
    pub async fn bootstrap_root(&self) -> Result<InodeAttr, MetaError> {
        let shard = self.router.route(InodeId::ROOT_INODE);
        let op = MetaOp::CreateInode {
            attr: InodeAttr::new_directory(InodeId::ROOT_INODE, 0, 0, 0o755),
        };
        match self.propose(shard, op).await {
            Ok(outcome) => outcome
                .attr
                .ok_or(MetaError::InodeNotFound(InodeId::ROOT_INODE)),
            Err(MetaError::InodeExists(_)) => self.getattr(InodeId::ROOT_INODE),
            Err(e) => Err(e),
        }
    }

    async fn create_node(
        &self,
        parent: InodeId,
        name: &str,
        build: impl Fn(InodeId) -> InodeAttr,
    ) -> Result<InodeAttr, MetaError> {
        self.check_writable()?;
        let shard = self.router.route(parent);
        let mut attempts = 0;
        loop {
            let ino = self.allocate_inode(shard)?;
            let attr = build(ino);
            let entry = DirEntry {
                name: name.to_string(),
                ino,
                file_type: attr.file_type,
            };
            let op = MetaOp::Transaction {
                ops: vec![
                    MetaOp::CreateInode { attr },
                    MetaOp::CreateEntry {
                        parent,
                        name: name.to_string(),
                        entry,
                    },
                ],
            };
            match self.propose(shard, op).await {
                Ok(outcome) => {
                    return outcome.attr.ok_or(MetaError::InodeNotFound(ino));
                }
                // a previous leader handed this number out; allocate past it
                Err(MetaError::InodeExists(_)) if attempts < 3 => attempts += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a regular file in a directory.
    pub async fn create(
        &self,
        parent: InodeId,
        name: &str,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<InodeAttr, MetaError> {
        self.create_node(parent, name, |ino| InodeAttr::new_file(ino, uid, gid, mode))
            .await
    }

    /// Creates a subdirectory.
    pub async fn mkdir(
        &self,
        parent: InodeId,
        name: &str,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<InodeAttr, MetaError> {
        self.create_node(parent, name, |ino| {
            InodeAttr::new_directory(ino, uid, gid, mode)
        })
        .await
    }

    /// Creates a symbolic link pointing at `target`.
    pub async fn symlink(
        &self,
        parent: InodeId,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr, MetaError> {
        self.create_node(parent, name, |ino| {
            InodeAttr::new_symlink(ino, uid, gid, 0o777, target.to_string())
        })
        .await
    }

    /// Adds another name for an existing non-directory inode.
    pub async fn link(&self, parent: InodeId, name: &str, ino: InodeId) -> Result<InodeAttr, MetaError> {
        self.check_writable()?;
        let (src, dst) = (self.router.route(ino), self.router.route(parent));
        if src != dst {
            return Err(MetaError::CrossShard { src, dst });
        }
        self.propose(
            dst,
            MetaOp::Link {
                parent,
                name: name.to_string(),
                ino,
            },
        )
        .await?;
        self.getattr(ino)
    }

    /// Removes a non-directory name. The inode is retired when its last
    /// name is gone and no handle is open.
    pub async fn unlink(&self, parent: InodeId, name: &str) -> Result<(), MetaError> {
        self.check_writable()?;
        let shard = self.router.route(parent);
        let entry = self.raft.state_machine(shard)?.lookup(parent, name)?;
        if entry.file_type == FileType::Directory {
            return Err(MetaError::IsADirectory(entry.ino));
        }
        let attr = self.getattr(entry.ino)?;
        let remove = MetaOp::DeleteEntry {
            parent,
            name: name.to_string(),
        };
        if attr.nlink > 1 || self.is_open(entry.ino)? {
            self.propose(shard, remove).await?;
            return Ok(());
        }
        let retire = MetaOp::Transaction {
            ops: vec![remove.clone(), MetaOp::DeleteInode { ino: entry.ino }],
        };
        match self.propose(shard, retire).await {
            Ok(_) => Ok(()),
            // a link was added since the count was read
            Err(MetaError::InodeStillLinked { .. }) | Err(MetaError::Conflict { .. }) => {
                self.propose(shard, remove).await?;
                self.retire_if_unused(entry.ino).await
            }
            Err(e) => Err(e),
        }
    }

    /// Removes an empty subdirectory.
    pub async fn rmdir(&self, parent: InodeId, name: &str) -> Result<(), MetaError> {
        self.check_writable()?;
        let shard = self.router.route(parent);
        let entry = self.raft.state_machine(shard)?.lookup(parent, name)?;
        if entry.file_type != FileType::Directory {
            return Err(MetaError::NotADirectory(entry.ino));
        }
        self.propose(
            shard,
            MetaOp::Transaction {
                ops: vec![
                    MetaOp::DeleteEntry {
                        parent,
                        name: name.to_string(),
                    },
                    MetaOp::DeleteInode { ino: entry.ino },
                ],
            },
        )
        .await?;
        Ok(())
    }

    /// Renames within one shard; a replaced inode is retired if nothing holds it.
    pub async fn rename(
        &self,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> Result<(), MetaError> {
        self.check_writable()?;
        let (src, dst) = (self.router.route(src_parent), self.router.route(dst_parent));
        if src != dst {
            return Err(MetaError::CrossShard { src, dst });
        }
        let outcome = self
            .propose(
                src,
                MetaOp::Rename {
                    src_parent,
                    src_name: src_name.to_string(),
                    dst_parent,
                    dst_name: dst_name.to_string(),
                },
            )
            .await?;
        for ino in outcome.orphaned_inodes {
            self.retire_if_unused(ino).await?;
        }
        Ok(())
    }

    /// Replaces an inode's attributes. Identity and link count are kept.
    pub async fn setattr(&self, ino: InodeId, attr: InodeAttr) -> Result<InodeAttr, MetaError> {
        self.check_writable()?;
        let mut attr = attr;
        attr.ctime = Timestamp::now();
        let outcome = self
            .propose(self.router.route(ino), MetaOp::SetAttr { ino, attr })
            .await?;
        outcome.attr.ok_or(MetaError::InodeNotFound(ino))
    }

    /// Sets an extended attribute.
    pub async fn set_xattr(&self, ino: InodeId, key: &str, value: &[u8]) -> Result<(), MetaError> {
        self.check_writable()?;
        self.propose(
            self.router.route(ino),
            MetaOp::SetXattr {
                ino,
                key: key.to_string(),
                value: value.to_vec(),
            },
        )
        .await?;
        Ok(())
    }

    /// Removes an extended attribute.
    pub async fn remove_xattr(&self, ino: InodeId, key: &str) -> Result<(), MetaError> {
        self.check_writable()?;
        self.propose(
            self.router.route(ino),
            MetaOp::RemoveXattr {
                ino,
                key: key.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    /// Commits an operation received from another site, bypassing the
    /// client access gate. The op must already be wrapped in `Replicated`.
    pub async fn apply_replicated(&self, op: MetaOp) -> Result<ApplyOutcome, MetaError> {
        self.check_readable()?;
        if !op.is_replicated() {
            return Err(MetaError::RaftError(format!(
                "{} is not a replicated operation",
                op.kind()
            )));
        }
        let ino = op
            .primary_inode()
            .ok_or_else(|| MetaError::RaftError("replicated op without target".to_string()))?;
        self.propose(self.router.route(ino), op).await
    }

    /// Looks up a name and returns the child's attributes.
    pub fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeAttr, MetaError> {
        let entry = self.lookup_entry(parent, name)?;
        self.getattr(entry.ino)
    }

    fn lookup_entry(&self, parent: InodeId, name: &str) -> Result<DirEntry, MetaError> {
        self.check_readable()?;
        let paths = self.coordinator.paths();
        if paths.check_negative(parent, name) {
            return Err(MetaError::EntryNotFound {
                parent,
                name: name.to_string(),
            });
        }
        match self.state_machine_for(parent)?.lookup(parent, name) {
            Ok(entry) => {
                paths.cache_resolution(
                    parent,
                    name,
                    PathCacheEntry {
                        ino: entry.ino,
                        file_type: entry.file_type,
                        shard: self.router.route(entry.ino),
                    },
                );
                Ok(entry)
            }
            Err(e) => {
                if matches!(e, MetaError::EntryNotFound { .. }) {
                    paths.cache_negative(parent, name);
                }
                Err(e)
            }
        }
    }

    /// Attributes of an inode.
    pub fn getattr(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        self.check_readable()?;
        self.state_machine_for(ino)?.get_attr(ino)
    }

    /// Entries of a directory, sorted by name.
    pub fn readdir(&self, parent: InodeId) -> Result<Vec<DirEntry>, MetaError> {
        self.check_readable()?;
        self.state_machine_for(parent)?.readdir(parent)
    }

    /// Target of a symbolic link.
    pub fn readlink(&self, ino: InodeId) -> Result<String, MetaError> {
        let attr = self.getattr(ino)?;
        attr.symlink_target.ok_or(MetaError::InvalidName(format!(
            "inode {} is not a symlink",
            ino
        )))
    }

    /// One extended attribute.
    pub fn get_xattr(&self, ino: InodeId, key: &str) -> Result<Vec<u8>, MetaError> {
        self.check_readable()?;
        self.state_machine_for(ino)?.get_xattr(ino, key)
    }

    /// Names of all extended attributes.
    pub fn list_xattrs(&self, ino: InodeId) -> Result<Vec<String>, MetaError> {
        self.check_readable()?;
        self.state_machine_for(ino)?.list_xattrs(ino)
    }

    /// Resolves an absolute path through the path cache.
    pub fn resolve_path(&self, path: &str) -> Result<InodeId, MetaError> {
        self.check_readable()?;
        self.coordinator.paths().resolve_path(path, |parent, name| {
            self.state_machine_for(parent)?.lookup(parent, name)
        })
    }

    /// Grants a lease on an existing inode.
    pub fn acquire_lease(
        &self,
        ino: InodeId,
        client: NodeId,
        lease_type: LeaseType,
    ) -> Result<Lease, MetaError> {
        self.getattr(ino)?;
        self.coordinator.leases().grant(ino, client, lease_type)
    }

    /// Releases a lease held by `client`.
    pub fn release_lease(&self, lease_id: u64, client: NodeId) -> Result<(), MetaError> {
        self.coordinator.leases().release(lease_id, client)
    }

    fn handles(&self) -> Result<std::sync::MutexGuard<'_, HashMap<InodeId, u32>>, MetaError> {
        self.open_handles
            .lock()
            .map_err(|e| MetaError::KvError(format!("handle table poisoned: {}", e)))
    }

    fn is_open(&self, ino: InodeId) -> Result<bool, MetaError> {
        Ok(self.handles()?.get(&ino).is_some_and(|n| *n > 0))
    }

    /// Records an open handle on an inode.
    pub fn open(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        let attr = self.getattr(ino)?;
        *self.handles()?.entry(ino).or_insert(0) += 1;
        Ok(attr)
    }

    /// Drops an open handle; the last release of an unlinked inode retires it.
    pub async fn release(&self, ino: InodeId) -> Result<(), MetaError> {
        let remaining = {
            let mut handles = self.handles()?;
            let count = handles.get_mut(&ino).ok_or(MetaError::InodeNotFound(ino))?;
            *count = count.saturating_sub(1);
            let remaining = *count;
            if remaining == 0 {
                handles.remove(&ino);
            }
            remaining
        };
        if remaining == 0 {
            self.retire_if_unused(ino).await?;
        }
        Ok(())
    }

    async fn retire_if_unused(&self, ino: InodeId) -> Result<(), MetaError> {
        if self.is_open(ino)? {
            return Ok(());
        }
        let attr = match self.getattr(ino) {
            Ok(attr) => attr,
            Err(MetaError::InodeNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if attr.nlink > 0 {
            return Ok(());
        }
        if self.check_writable().is_err() {
            tracing::warn!(ino = %ino, "site not writable, leaving orphaned inode");
            return Ok(());
        }
        match self
            .propose(self.router.route(ino), MetaOp::DeleteInode { ino })
            .await
        {
            // gone already, or linked again since the count was read
            Ok(_)
            | Err(MetaError::InodeNotFound(_))
            | Err(MetaError::InodeStillLinked { .. })
            | Err(MetaError::Conflict { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stops every shard group.
    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }
}
