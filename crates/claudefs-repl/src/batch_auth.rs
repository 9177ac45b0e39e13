//! Batch authentication using HMAC-SHA256 for entry batches.
//!
//! Implements sender authentication and application-layer integrity
//! for entry batches exchanged between sites. The tag covers, in order and
//! big-endian: source site id, batch sequence, entry count, then every
//! entry's canonical encoding prefixed by its length.

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::ReplError;
use crate::journal::ReplicatedEntry;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 key shared by the sites of a replication pair (32 bytes).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BatchAuthKey {
    bytes: [u8; 32],
}

impl BatchAuthKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Parses a key from 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, ReplError> {
        let mut decoded = hex::decode(s.trim())
            .map_err(|e| ReplError::Codec(format!("batch key is not hex: {}", e)))?;
        if decoded.len() != 32 {
            let len = decoded.len();
            decoded.zeroize();
            return Err(ReplError::Codec(format!(
                "batch key must be 32 bytes, got {}",
                len
            )));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for BatchAuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BatchAuthKey(..)")
    }
}

/// An authenticated batch tag (HMAC-SHA256 output, 32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTag {
    /// The 32-byte HMAC-SHA256 tag.
    pub bytes: [u8; 32],
}

impl BatchTag {
    /// Create a new batch tag from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Create a zero-initialized tag.
    pub fn zero() -> Self {
        Self { bytes: [0u8; 32] }
    }
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    /// The batch is authentic and unmodified.
    Valid,
    /// The batch failed authentication.
    Invalid {
        /// Reason for authentication failure.
        reason: String,
    },
}

/// Signs and verifies entry batches.
pub struct BatchAuthenticator {
    key: BatchAuthKey,
    local_site_id: u64,
}

impl BatchAuthenticator {
    /// Create a new batch authenticator.
    pub fn new(key: BatchAuthKey, local_site_id: u64) -> Self {
        Self { key, local_site_id }
    }

    /// Get the local site ID.
    pub fn local_site_id(&self) -> u64 {
        self.local_site_id
    }

    fn mac_over(
        &self,
        source_site_id: u64,
        batch_seq: u64,
        entries: &[ReplicatedEntry],
    ) -> Result<HmacSha256, ReplError> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| ReplError::Codec(e.to_string()))?;
        mac.update(&source_site_id.to_be_bytes());
        mac.update(&batch_seq.to_be_bytes());
        mac.update(&(entries.len() as u64).to_be_bytes());
        for entry in entries {
            let bytes = entry.canonical_bytes()?;
            mac.update(&(bytes.len() as u32).to_be_bytes());
            mac.update(&bytes);
        }
        Ok(mac)
    }

    /// Compute the HMAC-SHA256 tag for a batch.
    pub fn sign_batch(
        &self,
        source_site_id: u64,
        batch_seq: u64,
        entries: &[ReplicatedEntry],
    ) -> Result<BatchTag, ReplError> {
        let mac = self.mac_over(source_site_id, batch_seq, entries)?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&mac.finalize().into_bytes());
        Ok(BatchTag::new(bytes))
    }

    /// Verify a batch tag using constant-time comparison.
    pub fn verify_batch(
        &self,
        tag: &BatchTag,
        source_site_id: u64,
        batch_seq: u64,
        entries: &[ReplicatedEntry],
    ) -> AuthResult {
        let mac = match self.mac_over(source_site_id, batch_seq, entries) {
            Ok(mac) => mac,
            Err(e) => {
                return AuthResult::Invalid {
                    reason: e.to_string(),
                }
            }
        };
        match mac.verify_slice(&tag.bytes) {
            Ok(()) => AuthResult::Valid,
            Err(_) => AuthResult::Invalid {
                reason: "tag mismatch".to_string(),
            },
        }
    }
}
