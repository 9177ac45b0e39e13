use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an inode in the metadata service
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// The root inode ID (always 1)
    pub const ROOT_INODE: InodeId = InodeId(1);

    /// Creates a new InodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Returns the raw u64 value of this inode ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Computes the owning shard: `id mod num_shards`
    pub fn shard(self, num_shards: u16) -> ShardId {
        ShardId((self.0 % num_shards.max(1) as u64) as u16)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for a metadata server node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Creates a new NodeId from a raw u64 value
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    /// Returns the raw u64 value of this node ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual partition of the metadata keyspace (256 by default)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(u16);

impl ShardId {
    /// Creates a new ShardId from a raw u16 value
    pub const fn new(id: u16) -> Self {
        ShardId(id)
    }

    /// Returns the raw u16 value of this shard ID
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raft election epoch
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    /// Term zero, before any election.
    pub const ZERO: Term = Term(0);

    /// Creates a new Term from a raw u64 value
    pub fn new(t: u64) -> Self {
        Term(t)
    }

    /// Returns the raw u64 value of this term
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The term following this one.
    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in a shard's replicated log. Index 0 means "empty log"; the first entry is 1.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    /// A zero log index
    pub const ZERO: LogIndex = LogIndex(0);

    /// Creates a new LogIndex from a raw u64 value
    pub fn new(i: u64) -> Self {
        LogIndex(i)
    }

    /// Returns the raw u64 value of this log index
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The index after this one.
    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    /// The index before this one, saturating at zero.
    pub fn prev(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock point in time with nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// Creates a timestamp from raw parts.
    pub fn new(secs: u64, nanos: u32) -> Self {
        Self { secs, nanos }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Causality marker stamped on every mutated inode.
///
/// `site_id` is the site whose consensus group committed the write and
/// `sequence` is the committing entry's log index on that site. Two writes
/// compare equal only if they are the same committed write.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorClock {
    /// Site that produced the write
    pub site_id: u64,
    /// Per-site commit sequence
    pub sequence: u64,
}

impl VectorClock {
    /// Creates a new vector clock with the given site ID and sequence number
    pub fn new(site_id: u64, sequence: u64) -> Self {
        Self { site_id, sequence }
    }
}

impl Ord for VectorClock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.site_id.cmp(&other.site_id))
    }
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sequence, self.site_id)
    }
}

/// Error types for the metadata control plane
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The requested inode does not exist.
    #[error("inode {0} not found")]
    InodeNotFound(InodeId),

    /// The requested directory inode does not exist.
    #[error("directory inode {0} not found")]
    DirectoryNotFound(InodeId),

    /// A directory entry with the given name was not found.
    #[error("entry '{name}' not found in directory {parent}")]
    EntryNotFound {
        /// Parent directory inode
        parent: InodeId,
        /// Entry name that was not found
        name: String,
    },

    /// A directory entry with the given name already exists.
    #[error("entry '{name}' already exists in directory {parent}")]
    EntryExists {
        /// Parent directory inode
        parent: InodeId,
        /// Existing entry name
        name: String,
    },

    /// The inode has no extended attribute with this key.
    #[error("xattr '{key}' not found on inode {ino}")]
    XattrNotFound {
        /// Target inode
        ino: InodeId,
        /// Attribute key
        key: String,
    },

    /// An inode with this number already exists.
    #[error("inode {0} already exists")]
    InodeExists(InodeId),

    /// The specified inode is not a directory when a directory was required.
    #[error("inode {0} is not a directory")]
    NotADirectory(InodeId),

    /// The specified inode is a directory where a non-directory was required.
    #[error("inode {0} is a directory")]
    IsADirectory(InodeId),

    /// Attempted to delete a non-empty directory.
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(InodeId),

    /// An inode still reachable through a name cannot be deleted.
    #[error("inode {ino} still has {nlink} link(s)")]
    InodeStillLinked {
        /// Target inode
        ino: InodeId,
        /// Remaining link count
        nlink: u32,
    },

    /// A directory cannot be moved below itself.
    #[error("cannot move directory {0} into its own subtree")]
    RenameIntoSelf(InodeId),

    /// The operation spans two shards.
    #[error("operation spans shards {src} and {dst}")]
    CrossShard {
        /// Shard of the source parent
        src: ShardId,
        /// Shard of the destination parent
        dst: ShardId,
    },

    /// Invalid name or path component.
    #[error("invalid name '{0}'")]
    InvalidName(String),

    /// Operation denied due to insufficient permissions.
    #[error("permission denied")]
    PermissionDenied,

    /// The local site does not currently accept this class of operation.
    #[error("site is read-only")]
    ReadOnly,

    /// The local site is offline.
    #[error("site is offline")]
    SiteOffline,

    /// Operation requires the Raft leader but this node is not the leader.
    #[error("not the Raft leader")]
    NotLeader {
        /// Hint about the current leader
        leader_hint: Option<NodeId>,
    },

    /// The leader cannot reach a quorum; the shard is read-only until it can.
    #[error("quorum unavailable for shard {shard}")]
    QuorumUnavailable {
        /// Affected shard
        shard: ShardId,
    },

    /// Log consistency check failed; resolved inside consensus.
    #[error("log conflict at index {index}")]
    LogConflict {
        /// Index where the local log disagrees with the leader
        index: LogIndex,
    },

    /// A committed entry no longer validates against the current state.
    #[error("conflict applying entry {index}: {reason}")]
    Conflict {
        /// Committed index of the rejected entry
        index: LogIndex,
        /// Underlying validation failure
        reason: String,
    },

    /// Durable log or applied state is inconsistent.
    #[error("shard {shard} log corrupted: {reason}")]
    LogCorrupted {
        /// Affected shard
        shard: ShardId,
        /// Description of the inconsistency
        reason: String,
    },

    /// The shard's consensus group stopped after a fatal error.
    #[error("shard {0} is halted")]
    ShardHalted(ShardId),

    /// This node does not host the shard.
    #[error("shard {0} not hosted on this node")]
    ShardNotFound(ShardId),

    /// The caller gave up waiting for a commit.
    #[error("proposal timed out")]
    ProposalTimeout,

    /// An error occurred in the Raft consensus layer.
    #[error("raft error: {0}")]
    RaftError(String),

    /// An error occurred in the KV store layer.
    #[error("kv store error: {0}")]
    KvError(String),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl MetaError {
    /// Returns true for application errors that are reported to the caller
    /// and never retried automatically.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            MetaError::InodeNotFound(_)
                | MetaError::DirectoryNotFound(_)
                | MetaError::EntryNotFound { .. }
                | MetaError::EntryExists { .. }
                | MetaError::XattrNotFound { .. }
                | MetaError::InodeExists(_)
                | MetaError::NotADirectory(_)
                | MetaError::IsADirectory(_)
                | MetaError::DirectoryNotEmpty(_)
                | MetaError::InodeStillLinked { .. }
                | MetaError::RenameIntoSelf(_)
                | MetaError::CrossShard { .. }
                | MetaError::InvalidName(_)
                | MetaError::PermissionDenied
        )
    }

    /// Returns true for errors a caller should retry after backoff or redirect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaError::NotLeader { .. }
                | MetaError::QuorumUnavailable { .. }
                | MetaError::ProposalTimeout
        )
    }
}

/// File type enumeration matching POSIX file types
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file (S_IFREG)
    RegularFile,
    /// Directory (S_IFDIR)
    Directory,
    /// Symbolic link (S_IFLNK)
    Symlink,
    /// Block device (S_IFBLK)
    BlockDevice,
    /// Character device (S_IFCHR)
    CharDevice,
    /// FIFO/named pipe (S_IFIFO)
    Fifo,
    /// Socket (S_IFSOCK)
    Socket,
}

impl FileType {
    /// Returns the POSIX S_IFMT bits for this file type
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::RegularFile => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
            FileType::BlockDevice => 0o060000,
            FileType::CharDevice => 0o020000,
            FileType::Fifo => 0o010000,
            FileType::Socket => 0o140000,
        }
    }
}

/// Cross-site replication state of an inode
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// Last write was committed by the local site
    Local,
    /// Replication in progress
    Pending,
    /// Last write arrived from a remote site
    Replicated,
    /// Last write won a cross-site conflict
    Conflict,
}

/// Inode attributes combining POSIX stat fields with ClaudeFS extensions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Inode number
    pub ino: InodeId,
    /// File type
    pub file_type: FileType,
    /// Permission bits (lower 12 bits)
    pub mode: u32,
    /// Hard link count
    pub nlink: u32,
    /// Owner user ID
    pub uid: u32,
    /// Owner group ID
    pub gid: u32,
    /// File size in bytes
    pub size: u64,
    /// 512-byte blocks allocated
    pub blocks: u64,
    /// Last access time
    pub atime: Timestamp,
    /// Last modification time
    pub mtime: Timestamp,
    /// Last status change time
    pub ctime: Timestamp,
    /// Creation time
    pub crtime: Timestamp,
    /// BLAKE3 hash of content
    pub content_hash: Option<[u8; 32]>,
    /// Replication state
    pub repl_state: ReplicationState,
    /// Clock of the last committed write
    pub vector_clock: VectorClock,
    /// Incremented each time the inode number is reused
    pub generation: u64,
    /// Symlink target path (only valid for FileType::Symlink)
    pub symlink_target: Option<String>,
}

impl InodeAttr {
    fn with_type(ino: InodeId, file_type: FileType, uid: u32, gid: u32, mode: u32) -> Self {
        let now = Timestamp::now();
        Self {
            ino,
            file_type,
            mode,
            nlink: if file_type == FileType::Directory { 2 } else { 1 },
            uid,
            gid,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            content_hash: None,
            repl_state: ReplicationState::Local,
            vector_clock: VectorClock::default(),
            generation: 0,
            symlink_target: None,
        }
    }

    /// Creates a new directory inode
    pub fn new_directory(ino: InodeId, uid: u32, gid: u32, mode: u32) -> Self {
        Self::with_type(ino, FileType::Directory, uid, gid, mode)
    }

    /// Creates a new regular file inode
    pub fn new_file(ino: InodeId, uid: u32, gid: u32, mode: u32) -> Self {
        Self::with_type(ino, FileType::RegularFile, uid, gid, mode)
    }

    /// Creates a new symlink inode
    pub fn new_symlink(ino: InodeId, uid: u32, gid: u32, mode: u32, target: String) -> Self {
        let mut attr = Self::with_type(ino, FileType::Symlink, uid, gid, mode);
        attr.size = target.len() as u64;
        attr.symlink_target = Some(target);
        attr
    }

    /// Returns true if this inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// A directory entry linking a name to an inode
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Inode number
    pub ino: InodeId,
    /// File type
    pub file_type: FileType,
}

/// A single metadata mutation, the unit of consensus
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaOp {
    /// Create a new inode
    CreateInode {
        /// Inode attributes
        attr: InodeAttr,
    },
    /// Delete an inode
    DeleteInode {
        /// Inode ID to delete
        ino: InodeId,
    },
    /// Set inode attributes
    SetAttr {
        /// Target inode
        ino: InodeId,
        /// New attributes
        attr: InodeAttr,
    },
    /// Create a directory entry
    CreateEntry {
        /// Parent directory inode
        parent: InodeId,
        /// Entry name
        name: String,
        /// Directory entry
        entry: DirEntry,
    },
    /// Delete a directory entry
    DeleteEntry {
        /// Parent directory inode
        parent: InodeId,
        /// Entry name to delete
        name: String,
    },
    /// Rename a directory entry within one shard
    Rename {
        /// Source parent directory
        src_parent: InodeId,
        /// Source name
        src_name: String,
        /// Destination parent directory
        dst_parent: InodeId,
        /// Destination name
        dst_name: String,
    },
    /// Set extended attribute
    SetXattr {
        /// Target inode
        ino: InodeId,
        /// Attribute key
        key: String,
        /// Attribute value
        value: Vec<u8>,
    },
    /// Remove extended attribute
    RemoveXattr {
        /// Target inode
        ino: InodeId,
        /// Attribute key
        key: String,
    },
    /// Create a hard link
    Link {
        /// Parent directory for the new link
        parent: InodeId,
        /// Name of the new link
        name: String,
        /// Target inode
        ino: InodeId,
    },
    /// Several operations applied atomically as one entry
    Transaction {
        /// Operations in application order
        ops: Vec<MetaOp>,
    },
    /// An operation committed by a remote site, applied with its origin clock
    Replicated {
        /// Clock the origin site stamped on the write
        origin: VectorClock,
        /// Origin wall-clock time of the write
        timestamp: Timestamp,
        /// Whether the write won a concurrent conflict on arrival
        conflict: bool,
        /// The remote operation
        op: Box<MetaOp>,
    },
    /// A local operation carrying the proposer's wall-clock time, which
    /// becomes the change time of every inode it touches
    Stamped {
        /// Proposal time
        at: Timestamp,
        /// The operation
        op: Box<MetaOp>,
    },
    /// Appended by a new leader so entries inherited from earlier terms
    /// commit; changes nothing
    Noop,
}

impl MetaOp {
    /// Short name of the operation for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MetaOp::CreateInode { .. } => "create_inode",
            MetaOp::DeleteInode { .. } => "delete_inode",
            MetaOp::SetAttr { .. } => "set_attr",
            MetaOp::CreateEntry { .. } => "create_entry",
            MetaOp::DeleteEntry { .. } => "delete_entry",
            MetaOp::Rename { .. } => "rename",
            MetaOp::SetXattr { .. } => "set_xattr",
            MetaOp::RemoveXattr { .. } => "remove_xattr",
            MetaOp::Link { .. } => "link",
            MetaOp::Transaction { .. } => "transaction",
            MetaOp::Replicated { .. } => "replicated",
            MetaOp::Stamped { op, .. } => op.kind(),
            MetaOp::Noop => "noop",
        }
    }

    /// The inode whose clock this operation advances, if any.
    ///
    /// For entry operations this is the parent directory.
    pub fn primary_inode(&self) -> Option<InodeId> {
        match self {
            MetaOp::CreateInode { attr } => Some(attr.ino),
            MetaOp::DeleteInode { ino }
            | MetaOp::SetAttr { ino, .. }
            | MetaOp::SetXattr { ino, .. }
            | MetaOp::RemoveXattr { ino, .. } => Some(*ino),
            MetaOp::CreateEntry { parent, .. }
            | MetaOp::DeleteEntry { parent, .. }
            | MetaOp::Link { parent, .. } => Some(*parent),
            MetaOp::Rename { src_parent, .. } => Some(*src_parent),
            MetaOp::Transaction { ops } => ops.iter().find_map(|op| op.primary_inode()),
            MetaOp::Replicated { op, .. } | MetaOp::Stamped { op, .. } => op.primary_inode(),
            MetaOp::Noop => None,
        }
    }

    /// Returns true if the operation was committed by a remote site.
    pub fn is_replicated(&self) -> bool {
        matches!(self, MetaOp::Replicated { .. })
    }

    /// Wall-clock time the write happened at its origin, if it carries one.
    pub fn change_time(&self) -> Option<Timestamp> {
        match self {
            MetaOp::Replicated { timestamp, .. } => Some(*timestamp),
            MetaOp::Stamped { at, .. } => Some(*at),
            _ => None,
        }
    }

    /// Wraps a local operation with its proposal time. Remote writes and
    /// already stamped operations are returned unchanged.
    pub fn stamped(self, at: Timestamp) -> MetaOp {
        match self {
            MetaOp::Replicated { .. } | MetaOp::Stamped { .. } | MetaOp::Noop => self,
            op => MetaOp::Stamped {
                at,
                op: Box::new(op),
            },
        }
    }
}

/// A single entry in the Raft log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log index
    pub index: LogIndex,
    /// Term when entry was created
    pub term: Term,
    /// Operation to apply
    pub op: MetaOp,
}

/// Messages exchanged between Raft peers of one shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request for vote from candidate
    RequestVote {
        /// Candidate's term
        term: Term,
        /// Candidate node ID
        candidate_id: NodeId,
        /// Index of candidate's last log entry
        last_log_index: LogIndex,
        /// Term of candidate's last log entry
        last_log_term: Term,
    },
    /// Response to RequestVote
    RequestVoteResponse {
        /// Responder's term
        term: Term,
        /// Whether vote was granted
        vote_granted: bool,
    },
    /// Append entries from leader to follower (empty entries = heartbeat)
    AppendEntries {
        /// Leader's term
        term: Term,
        /// Leader node ID
        leader_id: NodeId,
        /// Index of log entry preceding new entries
        prev_log_index: LogIndex,
        /// Term of prev_log_index entry
        prev_log_term: Term,
        /// Log entries to append
        entries: Vec<LogEntry>,
        /// Leader's commit index
        leader_commit: LogIndex,
    },
    /// Response to AppendEntries
    AppendEntriesResponse {
        /// Follower's term
        term: Term,
        /// Whether append succeeded
        success: bool,
        /// Highest index known to match the leader on success; a retry hint on failure
        match_index: LogIndex,
    },
    /// Full state-machine image for a follower behind the compaction point
    InstallSnapshot {
        /// Leader's term
        term: Term,
        /// Leader node ID
        leader_id: NodeId,
        /// Last index covered by the snapshot
        last_included_index: LogIndex,
        /// Term of that index
        last_included_term: Term,
        /// Serialized state-machine image
        data: Vec<u8>,
    },
    /// Response to InstallSnapshot
    InstallSnapshotResponse {
        /// Follower's term
        term: Term,
        /// Index the follower now holds
        last_included_index: LogIndex,
    },
}

impl RaftMessage {
    /// The term carried by any message.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => *term,
        }
    }
}

/// Current role of a Raft node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Following a leader
    Follower,
    /// Campaigning for leadership
    Candidate,
    /// Leading the shard
    Leader,
}

impl fmt::Display for RaftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftState::Follower => write!(f, "follower"),
            RaftState::Candidate => write!(f, "candidate"),
            RaftState::Leader => write!(f, "leader"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inode_id_shard() {
        assert_eq!(InodeId::new(256).shard(256).as_u16(), 0);
        assert_eq!(InodeId::new(257).shard(256).as_u16(), 1);
        assert_eq!(InodeId::new(42).shard(1).as_u16(), 0);
        assert_eq!(InodeId::ROOT_INODE.shard(256).as_u16(), 1);
    }

    #[test]
    fn test_inode_id_shard_zero_shards_does_not_panic() {
        assert_eq!(InodeId::new(7).shard(0).as_u16(), 0);
    }

    #[test]
    fn test_log_index_next_prev() {
        assert_eq!(LogIndex::ZERO.next(), LogIndex::new(1));
        assert_eq!(LogIndex::ZERO.prev(), LogIndex::ZERO);
        assert_eq!(LogIndex::new(5).prev(), LogIndex::new(4));
    }

    #[test]
    fn test_timestamp_ord() {
        let t1 = Timestamp::new(100, 500);
        let t2 = Timestamp::new(100, 1000);
        let t3 = Timestamp::new(200, 0);
        assert!(t1 < t2);
        assert!(t2 < t3);
        assert_eq!(t1, Timestamp::new(100, 500));
    }

    #[test]
    fn test_timestamp_now_reasonable() {
        assert!(Timestamp::now().secs > 1_700_000_000);
    }

    #[test]
    fn test_vector_clock_ord_sequence_then_site() {
        assert!(VectorClock::new(100, 10) < VectorClock::new(1, 20));
        assert!(VectorClock::new(10, 100) < VectorClock::new(20, 100));
        assert_ne!(VectorClock::new(1, 5), VectorClock::new(2, 5));
    }

    #[test]
    fn test_new_directory_defaults() {
        let attr = InodeAttr::new_directory(InodeId::new(42), 1000, 1000, 0o755);
        assert!(attr.is_dir());
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.repl_state, ReplicationState::Local);
    }

    #[test]
    fn test_new_symlink_size_is_target_len() {
        let attr = InodeAttr::new_symlink(InodeId::new(9), 0, 0, 0o777, "/a/b".to_string());
        assert_eq!(attr.size, 4);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.symlink_target.as_deref(), Some("/a/b"));
    }

    #[test]
    fn test_primary_inode() {
        let op = MetaOp::CreateEntry {
            parent: InodeId::new(1),
            name: "a".to_string(),
            entry: DirEntry {
                name: "a".to_string(),
                ino: InodeId::new(5),
                file_type: FileType::RegularFile,
            },
        };
        assert_eq!(op.primary_inode(), Some(InodeId::new(1)));

        let txn = MetaOp::Transaction {
            ops: vec![
                MetaOp::CreateInode {
                    attr: InodeAttr::new_file(InodeId::new(5), 0, 0, 0o644),
                },
                op,
            ],
        };
        assert_eq!(txn.primary_inode(), Some(InodeId::new(5)));
        assert_eq!(txn.kind(), "transaction");
    }

    #[test]
    fn test_stamped_wraps_local_ops_once() {
        let at = Timestamp::new(500, 0);
        let op = MetaOp::SetXattr {
            ino: InodeId::new(3),
            key: "user.k".to_string(),
            value: vec![1],
        }
        .stamped(at);
        assert_eq!(op.change_time(), Some(at));
        assert_eq!(op.kind(), "set_xattr");
        assert_eq!(op.primary_inode(), Some(InodeId::new(3)));
        assert_eq!(op.clone().stamped(Timestamp::new(900, 0)), op);

        let remote = MetaOp::Replicated {
            origin: VectorClock::new(2, 1),
            timestamp: Timestamp::new(100, 0),
            conflict: false,
            op: Box::new(MetaOp::Noop),
        };
        assert_eq!(remote.clone().stamped(at), remote);
        assert_eq!(remote.change_time(), Some(Timestamp::new(100, 0)));
        assert_eq!(MetaOp::Noop.primary_inode(), None);
    }

    #[test]
    fn test_raft_message_term() {
        let msg = RaftMessage::AppendEntriesResponse {
            term: Term::new(7),
            success: true,
            match_index: LogIndex::new(3),
        };
        assert_eq!(msg.term(), Term::new(7));
    }

    #[test]
    fn test_meta_error_classification() {
        assert!(MetaError::DirectoryNotEmpty(InodeId::new(2)).is_validation_failure());
        assert!(MetaError::InodeStillLinked {
            ino: InodeId::new(2),
            nlink: 1
        }
        .is_validation_failure());
        assert!(MetaError::RenameIntoSelf(InodeId::new(2)).is_validation_failure());
        assert!(!MetaError::ProposalTimeout.is_validation_failure());
        assert!(MetaError::NotLeader { leader_hint: None }.is_retryable());
        assert!(MetaError::QuorumUnavailable {
            shard: ShardId::new(1)
        }
        .is_retryable());
        assert!(!MetaError::ShardHalted(ShardId::new(1)).is_retryable());
    }

    #[test]
    fn test_meta_error_display() {
        let err = MetaError::EntryExists {
            parent: InodeId::new(1),
            name: "foo".to_string(),
        };
        assert_eq!(err.to_string(), "entry 'foo' already exists in directory 1");
        assert_eq!(
            MetaError::QuorumUnavailable {
                shard: ShardId::new(3)
            }
            .to_string(),
            "quorum unavailable for shard 3"
        );
    }
}
