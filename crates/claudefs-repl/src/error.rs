//! Error types for the replication subsystem.

use claudefs_meta::MetaError;
use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A batch failed HMAC verification and was dropped.
    #[error("authentication failed for batch {batch_seq} from site {source_site_id}")]
    AuthenticationFailed {
        /// Site the batch claims to come from.
        source_site_id: u64,
        /// Sequence number of the rejected batch.
        batch_seq: u64,
    },

    /// Concurrent writes to the same inode were detected.
    #[error("conflict detected for inode {inode}: local_ts={local_ts}, remote_ts={remote_ts}")]
    ConflictDetected {
        /// The inode that has conflicting updates.
        inode: u64,
        /// Timestamp of the local update (nanoseconds).
        local_ts: u128,
        /// Timestamp of the remote update (nanoseconds).
        remote_ts: u128,
    },

    /// Unknown site ID.
    #[error("unknown site: {site_id}")]
    SiteUnknown {
        /// The unknown site identifier.
        site_id: u64,
    },

    /// Conduit transport error.
    #[error("transport error: {msg}")]
    Transport {
        /// Error message describing the issue.
        msg: String,
    },

    /// Protocol version mismatch.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Expected protocol version.
        expected: u16,
        /// Actual protocol version.
        got: u16,
    },

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The local metadata service refused or failed an operation.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Replication engine was shut down.
    #[error("replication engine shut down")]
    Shutdown,
}

impl From<bincode::Error> for ReplError {
    fn from(e: bincode::Error) -> Self {
        ReplError::Codec(e.to_string())
    }
}

impl ReplError {
    /// Returns true if the batch or connection can be retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplError::Transport { .. } | ReplError::Io(_) => true,
            ReplError::Meta(e) => e.is_retryable(),
            _ => false,
        }
    }
}
