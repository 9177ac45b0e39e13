//! Inode table.
//!
//! Inodes are stored under `inode/{inode_id_be}` as bincode. When an inode is
//! removed its generation is kept under `igen/{inode_id_be}` so a later reuse
//! of the same number gets a higher generation.

use std::sync::Arc;

use crate::kvstore::KvStore;
use crate::types::{InodeAttr, InodeId, MetaError};

const INODE_PREFIX: &[u8] = b"inode/";
const GENERATION_PREFIX: &[u8] = b"igen/";

fn inode_key(ino: InodeId) -> Vec<u8> {
    let mut key = INODE_PREFIX.to_vec();
    key.extend_from_slice(&ino.as_u64().to_be_bytes());
    key
}

fn generation_key(ino: InodeId) -> Vec<u8> {
    let mut key = GENERATION_PREFIX.to_vec();
    key.extend_from_slice(&ino.as_u64().to_be_bytes());
    key
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, MetaError> {
    bincode::serialize(value).map_err(|e| MetaError::KvError(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, MetaError> {
    bincode::deserialize(bytes).map_err(|e| MetaError::KvError(e.to_string()))
}

/// CRUD on inode attributes over a KV store.
pub struct InodeStore {
    kv: Arc<dyn KvStore>,
}

impl InodeStore {
    /// Creates a new InodeStore with the given KV store backend.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Inserts a new inode. Fails if the number is in use.
    pub fn create_inode(&self, attr: &InodeAttr) -> Result<(), MetaError> {
        let key = inode_key(attr.ino);
        if self.kv.contains_key(&key)? {
            return Err(MetaError::InodeExists(attr.ino));
        }
        self.kv.put(key, encode(attr)?)
    }

    /// Retrieves an inode's attributes.
    pub fn get_inode(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        self.try_get_inode(ino)?
            .ok_or(MetaError::InodeNotFound(ino))
    }

    /// Retrieves an inode's attributes, or None if absent.
    pub fn try_get_inode(&self, ino: InodeId) -> Result<Option<InodeAttr>, MetaError> {
        match self.kv.get(&inode_key(ino))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Overwrites an existing inode's attributes.
    pub fn set_inode(&self, attr: &InodeAttr) -> Result<(), MetaError> {
        let key = inode_key(attr.ino);
        if !self.kv.contains_key(&key)? {
            return Err(MetaError::InodeNotFound(attr.ino));
        }
        self.kv.put(key, encode(attr)?)
    }

    /// Removes an inode and remembers its generation.
    pub fn delete_inode(&self, ino: InodeId) -> Result<InodeAttr, MetaError> {
        let attr = self.get_inode(ino)?;
        self.kv.delete(&inode_key(ino))?;
        self.kv
            .put(generation_key(ino), attr.generation.to_be_bytes().to_vec())?;
        Ok(attr)
    }

    /// Generation of the last retired inode with this number.
    pub fn retired_generation(&self, ino: InodeId) -> Result<Option<u64>, MetaError> {
        match self.kv.get(&generation_key(ino))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    MetaError::KvError(format!("bad generation record for inode {}", ino))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Checks if an inode exists.
    pub fn exists(&self, ino: InodeId) -> Result<bool, MetaError> {
        self.kv.contains_key(&inode_key(ino))
    }

    /// All inodes in ascending number order.
    pub fn list_inodes(&self) -> Result<Vec<InodeAttr>, MetaError> {
        self.kv
            .scan_prefix(INODE_PREFIX)?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }
}
