//! Metadata state machine: the only mutator of the inode, directory and xattr tables.
//!
//! Committed entries are applied strictly in log order, exactly once. Each
//! entry is applied on an [`OverlayKvStore`] and committed with one atomic
//! batch, so an entry that no longer validates leaves the tables untouched and
//! is reported as a conflict. Application never reads the wall clock; all
//! timestamps come from the proposer, which keeps replicas bit-identical.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::directory::{validate_name, DirectoryStore};
use crate::inode::{decode, encode, InodeStore};
use crate::kvstore::{BatchOp, KvPair, KvStore, OverlayKvStore};
use crate::types::*;
use crate::xattr::XattrStore;

const APPLIED_KEY: &[u8] = b"sm/applied";
const HIGHEST_INODE_KEY: &[u8] = b"sm/highest_ino";
const TABLE_PREFIXES: [&[u8]; 6] = [
    b"dirent/",
    b"dparent/",
    b"igen/",
    b"inode/",
    b"sm/",
    b"xattr/",
];

/// Static identity of one shard's state machine.
#[derive(Clone, Debug)]
pub struct StateMachineConfig {
    /// Site that commits through this state machine
    pub site_id: u64,
    /// Shard this state machine serves
    pub shard_id: ShardId,
    /// Total shard count, used to reject cross-shard renames
    pub num_shards: u16,
}

/// How an entry was handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyStatus {
    /// The entry's mutations are now visible.
    Applied,
    /// The entry failed validation at apply time; nothing changed.
    Rejected(String),
    /// The index was already applied; nothing changed.
    AlreadyApplied,
}

/// Result of applying one committed entry.
#[derive(Clone, Debug)]
pub struct ApplyOutcome {
    /// Log index of the entry
    pub index: LogIndex,
    /// Term of the entry
    pub term: Term,
    /// What happened
    pub status: ApplyStatus,
    /// Clock stamped on every inode the entry mutated
    pub clock: VectorClock,
    /// Inode whose clock the operation advances
    pub primary: Option<InodeId>,
    /// Clock of `primary` before the entry
    pub prior_clock: Option<VectorClock>,
    /// Attributes of `primary` after the entry
    pub attr: Option<InodeAttr>,
    /// Directory entry created by the entry, if any
    pub entry: Option<DirEntry>,
    /// Every inode whose attributes, xattrs or entries changed
    pub affected_inodes: Vec<InodeId>,
    /// Every `(parent, name)` binding that was created, removed or replaced
    pub affected_names: Vec<(InodeId, String)>,
    /// Inodes removed from the table
    pub deleted_inodes: Vec<InodeId>,
    /// Inodes whose link count reached zero but that still exist
    pub orphaned_inodes: Vec<InodeId>,
    /// Change time stamped on the touched inodes, if the entry carried one
    pub changed_at: Option<Timestamp>,
}

impl ApplyOutcome {
    fn empty(entry: &LogEntry, status: ApplyStatus) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            status,
            clock: VectorClock::default(),
            primary: entry.op.primary_inode(),
            prior_clock: None,
            attr: None,
            entry: None,
            affected_inodes: Vec::new(),
            affected_names: Vec::new(),
            deleted_inodes: Vec::new(),
            orphaned_inodes: Vec::new(),
            changed_at: None,
        }
    }

    /// True if the entry changed state.
    pub fn is_applied(&self) -> bool {
        self.status == ApplyStatus::Applied
    }

    /// Converts a rejected outcome into the caller-facing conflict error.
    pub fn into_result(self) -> Result<ApplyOutcome, MetaError> {
        match &self.status {
            ApplyStatus::Rejected(reason) => Err(MetaError::Conflict {
                index: self.index,
                reason: reason.clone(),
            }),
            _ => Ok(self),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AppliedMark {
    index: LogIndex,
    term: Term,
}

#[derive(Serialize, Deserialize)]
struct SnapshotImage {
    last_applied: LogIndex,
    last_applied_term: Term,
    pairs: Vec<KvPair>,
}

/// Mutations collected while applying one entry.
struct ApplyCtx {
    inodes: InodeStore,
    dirs: DirectoryStore,
    xattrs: XattrStore,
    num_shards: u16,
    touched: BTreeSet<InodeId>,
    names: Vec<(InodeId, String)>,
    deleted: BTreeSet<InodeId>,
    created_entry: Option<DirEntry>,
    highest_inode: Option<InodeId>,
}

impl ApplyCtx {
    fn new(kv: Arc<dyn KvStore>, num_shards: u16) -> Self {
        Self {
            inodes: InodeStore::new(kv.clone()),
            dirs: DirectoryStore::new(kv.clone()),
            xattrs: XattrStore::new(kv),
            num_shards,
            touched: BTreeSet::new(),
            names: Vec::new(),
            deleted: BTreeSet::new(),
            created_entry: None,
            highest_inode: None,
        }
    }

    fn directory(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        let attr = self
            .inodes
            .try_get_inode(ino)?
            .ok_or(MetaError::DirectoryNotFound(ino))?;
        if !attr.is_dir() {
            return Err(MetaError::NotADirectory(ino));
        }
        Ok(attr)
    }

    fn touch(&mut self, ino: InodeId) {
        self.touched.insert(ino);
    }

    fn adjust_nlink(&mut self, ino: InodeId, delta: i64) -> Result<(), MetaError> {
        if let Some(mut attr) = self.inodes.try_get_inode(ino)? {
            attr.nlink = (attr.nlink as i64 + delta).max(0) as u32;
            self.inodes.set_inode(&attr)?;
            self.touch(ino);
        }
        Ok(())
    }

    /// Drops one link of an inode that lost a name.
    fn unlink_target(&mut self, parent: InodeId, entry: &DirEntry) -> Result<(), MetaError> {
        if entry.file_type == FileType::Directory {
            if !self.dirs.is_empty(entry.ino)? {
                return Err(MetaError::DirectoryNotEmpty(entry.ino));
            }
            if let Some(mut attr) = self.inodes.try_get_inode(entry.ino)? {
                attr.nlink = 0;
                self.inodes.set_inode(&attr)?;
                self.touch(entry.ino);
            }
            self.adjust_nlink(parent, -1)?;
        } else {
            self.adjust_nlink(entry.ino, -1)?;
        }
        Ok(())
    }

    fn apply_op(&mut self, op: &MetaOp) -> Result<(), MetaError> {
        match op {
            MetaOp::CreateInode { attr } => {
                let mut attr = attr.clone();
                if let Some(retired) = self.inodes.retired_generation(attr.ino)? {
                    attr.generation = attr.generation.max(retired + 1);
                }
                self.inodes.create_inode(&attr)?;
                if self.highest_inode.map_or(true, |h| attr.ino > h) {
                    self.highest_inode = Some(attr.ino);
                }
                self.touch(attr.ino);
            }
            MetaOp::DeleteInode { ino } => {
                let attr = self.inodes.get_inode(*ino)?;
                if attr.is_dir() && !self.dirs.is_empty(*ino)? {
                    return Err(MetaError::DirectoryNotEmpty(*ino));
                }
                if attr.nlink > 0 {
                    return Err(MetaError::InodeStillLinked {
                        ino: *ino,
                        nlink: attr.nlink,
                    });
                }
                self.inodes.delete_inode(*ino)?;
                self.xattrs.remove_all(*ino)?;
                self.touched.remove(ino);
                self.deleted.insert(*ino);
            }
            MetaOp::SetAttr { ino, attr } => {
                let current = self.inodes.get_inode(*ino)?;
                let mut next = attr.clone();
                // identity and link count are owned by the state machine
                next.ino = current.ino;
                next.file_type = current.file_type;
                next.generation = current.generation;
                next.nlink = current.nlink;
                self.inodes.set_inode(&next)?;
                self.touch(*ino);
            }
            MetaOp::CreateEntry {
                parent,
                name,
                entry,
            } => {
                validate_name(name)?;
                self.directory(*parent)?;
                let entry = DirEntry {
                    name: name.clone(),
                    ino: entry.ino,
                    file_type: entry.file_type,
                };
                self.dirs.create_entry(*parent, &entry)?;
                if entry.file_type == FileType::Directory {
                    self.adjust_nlink(*parent, 1)?;
                }
                self.touch(*parent);
                self.names.push((*parent, name.clone()));
                self.created_entry = Some(entry);
            }
            MetaOp::DeleteEntry { parent, name } => {
                self.directory(*parent)?;
                let entry = self.dirs.lookup(*parent, name)?;
                self.unlink_target(*parent, &entry)?;
                self.dirs.delete_entry(*parent, name)?;
                self.touch(*parent);
                self.names.push((*parent, name.clone()));
            }
            MetaOp::Rename {
                src_parent,
                src_name,
                dst_parent,
                dst_name,
            } => {
                let (src_shard, dst_shard) = (
                    src_parent.shard(self.num_shards),
                    dst_parent.shard(self.num_shards),
                );
                if src_shard != dst_shard {
                    return Err(MetaError::CrossShard {
                        src: src_shard,
                        dst: dst_shard,
                    });
                }
                validate_name(dst_name)?;
                self.directory(*src_parent)?;
                self.directory(*dst_parent)?;
                let source = self.dirs.lookup(*src_parent, src_name)?;
                if src_parent == dst_parent && src_name == dst_name {
                    return Ok(());
                }
                if source.file_type == FileType::Directory
                    && self.dirs.is_within(*dst_parent, source.ino)?
                {
                    return Err(MetaError::RenameIntoSelf(source.ino));
                }
                if let Some(existing) = self.dirs.try_lookup(*dst_parent, dst_name)? {
                    let src_dir = source.file_type == FileType::Directory;
                    let dst_dir = existing.file_type == FileType::Directory;
                    if src_dir && !dst_dir {
                        return Err(MetaError::NotADirectory(existing.ino));
                    }
                    if !src_dir && dst_dir {
                        return Err(MetaError::IsADirectory(existing.ino));
                    }
                    self.unlink_target(*dst_parent, &existing)?;
                }
                let (moved, _) =
                    self.dirs
                        .rename(*src_parent, src_name, *dst_parent, dst_name)?;
                if moved.file_type == FileType::Directory && src_parent != dst_parent {
                    self.adjust_nlink(*src_parent, -1)?;
                    self.adjust_nlink(*dst_parent, 1)?;
                }
                self.touch(*src_parent);
                self.touch(*dst_parent);
                self.touch(moved.ino);
                self.names.push((*src_parent, src_name.clone()));
                self.names.push((*dst_parent, dst_name.clone()));
                self.created_entry = Some(moved);
            }
            MetaOp::SetXattr { ino, key, value } => {
                self.inodes.get_inode(*ino)?;
                self.xattrs.set(*ino, key, value)?;
                self.touch(*ino);
            }
            MetaOp::RemoveXattr { ino, key } => {
                self.inodes.get_inode(*ino)?;
                self.xattrs.remove(*ino, key)?;
                self.touch(*ino);
            }
            MetaOp::Link { parent, name, ino } => {
                validate_name(name)?;
                self.directory(*parent)?;
                let target = self.inodes.get_inode(*ino)?;
                if target.is_dir() {
                    return Err(MetaError::IsADirectory(*ino));
                }
                let entry = DirEntry {
                    name: name.clone(),
                    ino: *ino,
                    file_type: target.file_type,
                };
                self.dirs.create_entry(*parent, &entry)?;
                self.adjust_nlink(*ino, 1)?;
                self.touch(*parent);
                self.names.push((*parent, name.clone()));
                self.created_entry = Some(entry);
            }
            MetaOp::Transaction { ops } => {
                for op in ops {
                    self.apply_op(op)?;
                }
            }
            MetaOp::Replicated { op, .. } | MetaOp::Stamped { op, .. } => self.apply_op(op)?,
            MetaOp::Noop => {}
        }
        Ok(())
    }
}

/// One shard's metadata tables plus the apply cursor.
pub struct MetaStateMachine {
    kv: Arc<dyn KvStore>,
    config: StateMachineConfig,
    applied: Mutex<(LogIndex, Term)>,
}

impl MetaStateMachine {
    /// Opens a state machine over `kv`, resuming from the persisted apply cursor.
    pub fn open(kv: Arc<dyn KvStore>, config: StateMachineConfig) -> Result<Self, MetaError> {
        let applied = match kv.get(APPLIED_KEY)? {
            Some(bytes) => {
                let mark: AppliedMark = decode(&bytes)?;
                (mark.index, mark.term)
            }
            None => (LogIndex::ZERO, Term::ZERO),
        };
        Ok(Self {
            kv,
            config,
            applied: Mutex::new(applied),
        })
    }

    /// Shard this state machine serves.
    pub fn shard_id(&self) -> ShardId {
        self.config.shard_id
    }

    /// Local site id.
    pub fn site_id(&self) -> u64 {
        self.config.site_id
    }

    fn cursor(&self) -> Result<std::sync::MutexGuard<'_, (LogIndex, Term)>, MetaError> {
        self.applied
            .lock()
            .map_err(|e| MetaError::KvError(e.to_string()))
    }

    /// Index of the last applied entry.
    pub fn last_applied(&self) -> LogIndex {
        self.cursor().map(|c| c.0).unwrap_or(LogIndex::ZERO)
    }

    /// Term of the last applied entry.
    pub fn last_applied_term(&self) -> Term {
        self.cursor().map(|c| c.1).unwrap_or(Term::ZERO)
    }

    /// Applies one committed entry. Entries must arrive in index order.
    ///
    /// An index at or below the cursor is ignored. A gap means the log and the
    /// tables disagree, which is fatal for the shard.
    pub fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome, MetaError> {
        let mut cursor = self.cursor()?;
        if entry.index <= cursor.0 {
            return Ok(ApplyOutcome::empty(entry, ApplyStatus::AlreadyApplied));
        }
        if entry.index != cursor.0.next() {
            return Err(MetaError::LogCorrupted {
                shard: self.config.shard_id,
                reason: format!(
                    "apply gap: last applied {}, got entry {}",
                    cursor.0, entry.index
                ),
            });
        }

        let (clock, repl_state) = match &entry.op {
            MetaOp::Replicated {
                origin, conflict, ..
            } => (
                *origin,
                if *conflict {
                    ReplicationState::Conflict
                } else {
                    ReplicationState::Replicated
                },
            ),
            _ => (
                VectorClock::new(self.config.site_id, entry.index.as_u64()),
                ReplicationState::Local,
            ),
        };

        let primary = entry.op.primary_inode();
        let inodes = InodeStore::new(self.kv.clone());
        let prior_clock = match primary {
            Some(ino) => inodes.try_get_inode(ino)?.map(|a| a.vector_clock),
            None => None,
        };

        let overlay = Arc::new(OverlayKvStore::new(self.kv.clone()));
        let mut ctx = ApplyCtx::new(overlay.clone(), self.config.num_shards);
        let result = ctx.apply_op(&entry.op);

        let mark = encode(&AppliedMark {
            index: entry.index,
            term: entry.term,
        })?;

        let mut outcome = ApplyOutcome::empty(entry, ApplyStatus::Applied);
        outcome.prior_clock = prior_clock;

        if let Err(e) = result {
            if !e.is_validation_failure() {
                return Err(e);
            }
            tracing::warn!(
                shard_id = %self.config.shard_id,
                index = %entry.index,
                op = entry.op.kind(),
                error = %e,
                "committed entry rejected at apply time"
            );
            self.kv.put(APPLIED_KEY.to_vec(), mark)?;
            *cursor = (entry.index, entry.term);
            outcome.status = ApplyStatus::Rejected(e.to_string());
            return Ok(outcome);
        }

        let changed_at = entry.op.change_time();
        let mut orphaned = Vec::new();
        for ino in &ctx.touched {
            if let Some(mut attr) = ctx.inodes.try_get_inode(*ino)? {
                attr.vector_clock = clock;
                attr.repl_state = repl_state;
                if let Some(at) = changed_at {
                    attr.ctime = at;
                }
                if attr.nlink == 0 {
                    orphaned.push(*ino);
                }
                ctx.inodes.set_inode(&attr)?;
            }
        }
        if let Some(highest) = ctx.highest_inode {
            if self.highest_inode()?.map_or(true, |h| highest > h) {
                overlay.put(HIGHEST_INODE_KEY.to_vec(), highest.as_u64().to_be_bytes().to_vec())?;
            }
        }

        outcome.clock = clock;
        outcome.changed_at = changed_at;
        outcome.attr = match primary {
            Some(ino) => ctx.inodes.try_get_inode(ino)?,
            None => None,
        };
        outcome.entry = ctx.created_entry.take();
        outcome.affected_inodes = ctx
            .touched
            .iter()
            .chain(ctx.deleted.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        outcome.affected_names = std::mem::take(&mut ctx.names);
        outcome.deleted_inodes = ctx.deleted.iter().copied().collect();
        outcome.orphaned_inodes = orphaned;
        drop(ctx);

        overlay.put(APPLIED_KEY.to_vec(), mark)?;
        let overlay = Arc::try_unwrap(overlay)
            .map_err(|_| MetaError::KvError("apply overlay still shared".to_string()))?;
        overlay.commit()?;
        *cursor = (entry.index, entry.term);

        tracing::debug!(
            shard_id = %self.config.shard_id,
            index = %entry.index,
            op = entry.op.kind(),
            clock = %clock,
            "applied entry"
        );
        Ok(outcome)
    }

    /// Checks an operation against current state without changing anything.
    pub fn validate(&self, op: &MetaOp) -> Result<(), MetaError> {
        let overlay: Arc<dyn KvStore> = Arc::new(OverlayKvStore::new(self.kv.clone()));
        let mut ctx = ApplyCtx::new(overlay, self.config.num_shards);
        ctx.apply_op(op)
    }

    /// Attributes of an inode.
    pub fn get_attr(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        InodeStore::new(self.kv.clone()).get_inode(ino)
    }

    /// Resolves one name in a directory.
    pub fn lookup(&self, parent: InodeId, name: &str) -> Result<DirEntry, MetaError> {
        let inodes = InodeStore::new(self.kv.clone());
        let dir = inodes
            .try_get_inode(parent)?
            .ok_or(MetaError::DirectoryNotFound(parent))?;
        if !dir.is_dir() {
            return Err(MetaError::NotADirectory(parent));
        }
        DirectoryStore::new(self.kv.clone()).lookup(parent, name)
    }

    /// Lists a directory in name order.
    pub fn readdir(&self, parent: InodeId) -> Result<Vec<DirEntry>, MetaError> {
        let dir = self.get_attr(parent)?;
        if !dir.is_dir() {
            return Err(MetaError::NotADirectory(parent));
        }
        DirectoryStore::new(self.kv.clone()).list_entries(parent)
    }

    /// Reads one extended attribute.
    pub fn get_xattr(&self, ino: InodeId, key: &str) -> Result<Vec<u8>, MetaError> {
        self.get_attr(ino)?;
        XattrStore::new(self.kv.clone()).get(ino, key)
    }

    /// Lists extended attribute keys.
    pub fn list_xattrs(&self, ino: InodeId) -> Result<Vec<String>, MetaError> {
        self.get_attr(ino)?;
        XattrStore::new(self.kv.clone()).list(ino)
    }

    /// Current clock of an inode, or None if it does not exist.
    pub fn clock_of(&self, ino: InodeId) -> Result<Option<VectorClock>, MetaError> {
        Ok(InodeStore::new(self.kv.clone())
            .try_get_inode(ino)?
            .map(|a| a.vector_clock))
    }

    /// Highest inode number ever created on this shard.
    pub fn highest_inode(&self) -> Result<Option<InodeId>, MetaError> {
        match self.kv.get(HIGHEST_INODE_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| MetaError::KvError("bad highest inode record".to_string()))?;
                Ok(Some(InodeId::new(u64::from_be_bytes(raw))))
            }
            None => Ok(None),
        }
    }

    fn table_pairs(&self) -> Result<Vec<KvPair>, MetaError> {
        let mut pairs = Vec::new();
        for prefix in TABLE_PREFIXES {
            pairs.extend(self.kv.scan_prefix(prefix)?);
        }
        Ok(pairs)
    }

    /// Serializes the full table image at the current cursor.
    pub fn snapshot(&self) -> Result<Vec<u8>, MetaError> {
        let cursor = self.cursor()?;
        let image = SnapshotImage {
            last_applied: cursor.0,
            last_applied_term: cursor.1,
            pairs: self.table_pairs()?,
        };
        encode(&image)
    }

    /// Replaces all tables with a snapshot image.
    pub fn restore(&self, data: &[u8]) -> Result<LogIndex, MetaError> {
        let image: SnapshotImage = decode(data)?;
        let mut cursor = self.cursor()?;
        let mut batch: Vec<BatchOp> = self
            .table_pairs()?
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        batch.extend(
            image
                .pairs
                .into_iter()
                .map(|(key, value)| BatchOp::Put { key, value }),
        );
        self.kv.write_batch(batch)?;
        *cursor = (image.last_applied, image.last_applied_term);
        tracing::info!(
            shard_id = %self.config.shard_id,
            last_applied = %image.last_applied,
            "restored state machine from snapshot"
        );
        Ok(image.last_applied)
    }

    /// BLAKE3 digest of the table image; equal on replicas that applied the same prefix.
    pub fn fingerprint(&self) -> Result<[u8; 32], MetaError> {
        let mut hasher = blake3::Hasher::new();
        for (k, v) in self.table_pairs()? {
            hasher.update(&(k.len() as u64).to_be_bytes());
            hasher.update(&k);
            hasher.update(&(v.len() as u64).to_be_bytes());
            hasher.update(&v);
        }
        Ok(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;

    fn make_sm(site_id: u64) -> MetaStateMachine {
        MetaStateMachine::open(
            Arc::new(MemoryKvStore::new()),
            StateMachineConfig {
                site_id,
                shard_id: ShardId::new(0),
                num_shards: 1,
            },
        )
        .unwrap()
    }

    fn entry(index: u64, op: MetaOp) -> LogEntry {
        LogEntry {
            index: LogIndex::new(index),
            term: Term::new(1),
            op,
        }
    }

    fn root_op() -> MetaOp {
        MetaOp::CreateInode {
            attr: InodeAttr::new_directory(InodeId::ROOT_INODE, 0, 0, 0o755),
        }
    }

    fn create_file(ino: u64, name: &str) -> MetaOp {
        MetaOp::Transaction {
            ops: vec![
                MetaOp::CreateInode {
                    attr: InodeAttr::new_file(InodeId::new(ino), 0, 0, 0o644),
                },
                MetaOp::CreateEntry {
                    parent: InodeId::ROOT_INODE,
                    name: name.to_string(),
                    entry: DirEntry {
                        name: name.to_string(),
                        ino: InodeId::new(ino),
                        file_type: FileType::RegularFile,
                    },
                },
            ],
        }
    }

    fn mkdir(ino: u64, name: &str) -> MetaOp {
        mkdir_in(InodeId::ROOT_INODE, ino, name)
    }

    fn mkdir_in(parent: InodeId, ino: u64, name: &str) -> MetaOp {
        MetaOp::Transaction {
            ops: vec![
                MetaOp::CreateInode {
                    attr: InodeAttr::new_directory(InodeId::new(ino), 0, 0, 0o755),
                },
                MetaOp::CreateEntry {
                    parent,
                    name: name.to_string(),
                    entry: DirEntry {
                        name: name.to_string(),
                        ino: InodeId::new(ino),
                        file_type: FileType::Directory,
                    },
                },
            ],
        }
    }

    #[test]
    fn test_apply_stamps_local_clock() {
        let sm = make_sm(7);
        sm.apply(&entry(1, root_op())).unwrap();
        let out = sm.apply(&entry(2, create_file(42, "a"))).unwrap();

        assert!(out.is_applied());
        assert_eq!(out.clock, VectorClock::new(7, 2));
        assert_eq!(out.prior_clock, None);
        let attr = sm.get_attr(InodeId::new(42)).unwrap();
        assert_eq!(attr.vector_clock, VectorClock::new(7, 2));
        assert_eq!(attr.repl_state, ReplicationState::Local);
        // parent directory changed too
        assert_eq!(
            sm.get_attr(InodeId::ROOT_INODE).unwrap().vector_clock,
            VectorClock::new(7, 2)
        );
        assert_eq!(sm.last_applied(), LogIndex::new(2));
        assert_eq!(
            out.affected_names,
            vec![(InodeId::ROOT_INODE, "a".to_string())]
        );
    }

    #[test]
    fn test_apply_is_exactly_once_and_ordered() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        let dup = sm.apply(&entry(1, root_op())).unwrap();
        assert_eq!(dup.status, ApplyStatus::AlreadyApplied);

        let gap = sm.apply(&entry(3, create_file(5, "x")));
        assert!(matches!(gap, Err(MetaError::LogCorrupted { .. })));
        assert_eq!(sm.last_applied(), LogIndex::new(1));
    }

    #[test]
    fn test_failed_transaction_leaves_state_unchanged() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, create_file(10, "taken"))).unwrap();
        let before = sm.fingerprint().unwrap();

        // inode 11 would be created, then the entry name collides
        let out = sm.apply(&entry(3, create_file(11, "taken"))).unwrap();
        assert!(matches!(out.status, ApplyStatus::Rejected(_)));
        assert!(sm.get_attr(InodeId::new(11)).is_err());
        assert_eq!(sm.last_applied(), LogIndex::new(3));

        let err = out.into_result().unwrap_err();
        assert!(matches!(err, MetaError::Conflict { index, .. } if index == LogIndex::new(3)));
        // only the cursor moved
        assert_ne!(sm.fingerprint().unwrap(), before);
        assert_eq!(sm.readdir(InodeId::ROOT_INODE).unwrap().len(), 1);
    }

    #[test]
    fn test_validate_does_not_mutate() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        let before = sm.fingerprint().unwrap();
        sm.validate(&create_file(20, "f")).unwrap();
        assert_eq!(sm.fingerprint().unwrap(), before);

        sm.apply(&entry(2, create_file(20, "f"))).unwrap();
        assert!(matches!(
            sm.validate(&create_file(21, "f")),
            Err(MetaError::EntryExists { .. })
        ));
    }

    #[test]
    fn test_rmdir_requires_empty_directory() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, mkdir(30, "d"))).unwrap();
        assert_eq!(sm.get_attr(InodeId::ROOT_INODE).unwrap().nlink, 3);

        let child = MetaOp::Transaction {
            ops: vec![
                MetaOp::CreateInode {
                    attr: InodeAttr::new_file(InodeId::new(31), 0, 0, 0o644),
                },
                MetaOp::CreateEntry {
                    parent: InodeId::new(30),
                    name: "c".to_string(),
                    entry: DirEntry {
                        name: "c".to_string(),
                        ino: InodeId::new(31),
                        file_type: FileType::RegularFile,
                    },
                },
            ],
        };
        sm.apply(&entry(3, child)).unwrap();

        let rmdir = MetaOp::Transaction {
            ops: vec![
                MetaOp::DeleteEntry {
                    parent: InodeId::ROOT_INODE,
                    name: "d".to_string(),
                },
                MetaOp::DeleteInode {
                    ino: InodeId::new(30),
                },
            ],
        };
        assert!(matches!(
            sm.validate(&rmdir),
            Err(MetaError::DirectoryNotEmpty(_))
        ));
    }

    #[test]
    fn test_rename_over_file_orphans_target() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, create_file(40, "a"))).unwrap();
        sm.apply(&entry(3, create_file(41, "b"))).unwrap();

        let out = sm
            .apply(&entry(
                4,
                MetaOp::Rename {
                    src_parent: InodeId::ROOT_INODE,
                    src_name: "a".to_string(),
                    dst_parent: InodeId::ROOT_INODE,
                    dst_name: "b".to_string(),
                },
            ))
            .unwrap();
        assert!(out.is_applied());
        assert_eq!(out.orphaned_inodes, vec![InodeId::new(41)]);
        assert_eq!(
            sm.lookup(InodeId::ROOT_INODE, "b").unwrap().ino,
            InodeId::new(40)
        );
        assert!(sm.lookup(InodeId::ROOT_INODE, "a").is_err());
    }

    #[test]
    fn test_cross_shard_rename_rejected() {
        let sm = MetaStateMachine::open(
            Arc::new(MemoryKvStore::new()),
            StateMachineConfig {
                site_id: 1,
                shard_id: ShardId::new(1),
                num_shards: 4,
            },
        )
        .unwrap();
        let op = MetaOp::Rename {
            src_parent: InodeId::new(1),
            src_name: "a".to_string(),
            dst_parent: InodeId::new(2),
            dst_name: "b".to_string(),
        };
        assert!(matches!(
            sm.validate(&op),
            Err(MetaError::CrossShard { .. })
        ));
    }

    #[test]
    fn test_inode_reuse_bumps_generation() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, create_file(50, "g"))).unwrap();
        let unlink = MetaOp::Transaction {
            ops: vec![
                MetaOp::DeleteEntry {
                    parent: InodeId::ROOT_INODE,
                    name: "g".to_string(),
                },
                MetaOp::DeleteInode {
                    ino: InodeId::new(50),
                },
            ],
        };
        let out = sm.apply(&entry(3, unlink)).unwrap();
        assert_eq!(out.deleted_inodes, vec![InodeId::new(50)]);
        sm.apply(&entry(4, create_file(50, "g"))).unwrap();
        assert_eq!(sm.get_attr(InodeId::new(50)).unwrap().generation, 1);
        assert_eq!(sm.highest_inode().unwrap(), Some(InodeId::new(50)));
    }

    #[test]
    fn test_replicated_op_keeps_origin_clock() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, create_file(60, "r"))).unwrap();

        let mut attr = sm.get_attr(InodeId::new(60)).unwrap();
        attr.mode = 0o600;
        let op = MetaOp::Replicated {
            origin: VectorClock::new(2, 90),
            timestamp: Timestamp::new(5, 0),
            conflict: true,
            op: Box::new(MetaOp::SetAttr {
                ino: InodeId::new(60),
                attr,
            }),
        };
        let out = sm.apply(&entry(3, op)).unwrap();
        assert_eq!(out.prior_clock, Some(VectorClock::new(1, 2)));
        let attr = sm.get_attr(InodeId::new(60)).unwrap();
        assert_eq!(attr.vector_clock, VectorClock::new(2, 90));
        assert_eq!(attr.repl_state, ReplicationState::Conflict);
        assert_eq!(attr.mode, 0o600);
        assert_eq!(attr.ctime, Timestamp::new(5, 0));
    }

    #[test]
    fn test_stale_unlink_cannot_retire_linked_inode() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, create_file(80, "f"))).unwrap();
        // the unlink below was built when "f" was the only name
        let stale = MetaOp::Transaction {
            ops: vec![
                MetaOp::DeleteEntry {
                    parent: InodeId::ROOT_INODE,
                    name: "f".to_string(),
                },
                MetaOp::DeleteInode {
                    ino: InodeId::new(80),
                },
            ],
        };
        sm.apply(&entry(
            3,
            MetaOp::Link {
                parent: InodeId::ROOT_INODE,
                name: "g".to_string(),
                ino: InodeId::new(80),
            },
        ))
        .unwrap();

        assert!(matches!(
            sm.validate(&stale),
            Err(MetaError::InodeStillLinked { nlink: 1, .. })
        ));
        let out = sm.apply(&entry(4, stale)).unwrap();
        assert!(matches!(out.status, ApplyStatus::Rejected(_)));
        assert_eq!(sm.get_attr(InodeId::new(80)).unwrap().nlink, 2);
        for name in ["f", "g"] {
            assert_eq!(
                sm.lookup(InodeId::ROOT_INODE, name).unwrap().ino,
                InodeId::new(80)
            );
        }
    }

    #[test]
    fn test_rename_into_own_subtree_rejected() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, mkdir(90, "a"))).unwrap();
        sm.apply(&entry(3, mkdir_in(InodeId::new(90), 91, "b"))).unwrap();
        let before = sm.readdir(InodeId::ROOT_INODE).unwrap();

        for dst_parent in [InodeId::new(90), InodeId::new(91)] {
            let op = MetaOp::Rename {
                src_parent: InodeId::ROOT_INODE,
                src_name: "a".to_string(),
                dst_parent,
                dst_name: "a".to_string(),
            };
            assert!(matches!(
                sm.validate(&op),
                Err(MetaError::RenameIntoSelf(ino)) if ino == InodeId::new(90)
            ));
        }
        let out = sm
            .apply(&entry(
                4,
                MetaOp::Rename {
                    src_parent: InodeId::ROOT_INODE,
                    src_name: "a".to_string(),
                    dst_parent: InodeId::new(91),
                    dst_name: "a".to_string(),
                },
            ))
            .unwrap();
        assert!(matches!(out.status, ApplyStatus::Rejected(_)));
        assert_eq!(sm.readdir(InodeId::ROOT_INODE).unwrap(), before);

        // once "b" moves out, "a" may go below it
        sm.apply(&entry(
            5,
            MetaOp::Rename {
                src_parent: InodeId::new(90),
                src_name: "b".to_string(),
                dst_parent: InodeId::ROOT_INODE,
                dst_name: "b".to_string(),
            },
        ))
        .unwrap();
        let out = sm
            .apply(&entry(
                6,
                MetaOp::Rename {
                    src_parent: InodeId::ROOT_INODE,
                    src_name: "a".to_string(),
                    dst_parent: InodeId::new(91),
                    dst_name: "a".to_string(),
                },
            ))
            .unwrap();
        assert!(out.is_applied());
        assert_eq!(
            sm.lookup(InodeId::new(91), "a").unwrap().ino,
            InodeId::new(90)
        );
    }

    #[test]
    fn test_stamped_op_sets_change_time() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, create_file(95, "t"))).unwrap();
        let root_ctime = sm.get_attr(InodeId::ROOT_INODE).unwrap().ctime;

        let op = MetaOp::SetXattr {
            ino: InodeId::new(95),
            key: "user.k".to_string(),
            value: b"v".to_vec(),
        }
        .stamped(Timestamp::new(500, 0));
        let out = sm.apply(&entry(3, op)).unwrap();
        assert_eq!(out.changed_at, Some(Timestamp::new(500, 0)));
        assert_eq!(out.attr.map(|a| a.ctime), Some(Timestamp::new(500, 0)));
        assert_eq!(
            sm.get_attr(InodeId::new(95)).unwrap().ctime,
            Timestamp::new(500, 0)
        );
        assert_eq!(sm.get_attr(InodeId::ROOT_INODE).unwrap().ctime, root_ctime);
    }

    #[test]
    fn test_noop_only_advances_cursor() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        let before = sm.readdir(InodeId::ROOT_INODE).unwrap();
        let out = sm.apply(&entry(2, MetaOp::Noop)).unwrap();
        assert!(out.is_applied());
        assert!(out.affected_inodes.is_empty());
        assert_eq!(sm.last_applied(), LogIndex::new(2));
        assert_eq!(sm.readdir(InodeId::ROOT_INODE).unwrap(), before);
    }

    #[test]
    fn test_snapshot_restore_matches_fingerprint() {
        let sm = make_sm(1);
        sm.apply(&entry(1, root_op())).unwrap();
        sm.apply(&entry(2, create_file(70, "s"))).unwrap();
        sm.apply(&entry(
            3,
            MetaOp::SetXattr {
                ino: InodeId::new(70),
                key: "user.k".to_string(),
                value: b"v".to_vec(),
            },
        ))
        .unwrap();
        let image = sm.snapshot().unwrap();

        let other = make_sm(1);
        other.apply(&entry(1, root_op())).unwrap();
        assert_eq!(other.restore(&image).unwrap(), LogIndex::new(3));
        assert_eq!(other.last_applied(), LogIndex::new(3));
        assert_eq!(other.fingerprint().unwrap(), sm.fingerprint().unwrap());
        assert_eq!(other.get_xattr(InodeId::new(70), "user.k").unwrap(), b"v");
    }

    #[test]
    fn test_open_resumes_cursor() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let config = StateMachineConfig {
            site_id: 1,
            shard_id: ShardId::new(0),
            num_shards: 1,
        };
        let sm = MetaStateMachine::open(kv.clone(), config.clone()).unwrap();
        sm.apply(&entry(1, root_op())).unwrap();
        drop(sm);

        let reopened = MetaStateMachine::open(kv, config).unwrap();
        assert_eq!(reopened.last_applied(), LogIndex::new(1));
        assert_eq!(reopened.last_applied_term(), Term::new(1));
    }
}
