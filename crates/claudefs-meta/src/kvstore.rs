//! Key-value storage backing the metadata tables and the Raft log.
//!
//! `MemoryKvStore` is the in-process backend. `OverlayKvStore` stages the
//! writes of one log entry on top of a base store so the entry either commits
//! with a single atomic batch or leaves the base untouched.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use crate::types::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store abstraction shared by the metadata tables and the log store.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Scan all keys with the given prefix in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Scan keys in `[start, end)` in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.get(key)?.is_some())
    }

    /// Atomically write a batch of puts and deletes.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// A single operation in a write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

fn lock_err<E: std::fmt::Display>(e: E) -> MetaError {
    MetaError::KvError(e.to_string())
}

/// In-memory KV store backed by a BTreeMap.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(lock_err)?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(lock_err)?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data
            .range::<Vec<u8>, _>(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data
            .range::<Vec<u8>, _>((
                Bound::Included(start.to_vec()),
                Bound::Excluded(end.to_vec()),
            ))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        let data = self.data.read().map_err(lock_err)?;
        Ok(data.contains_key(key))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(lock_err)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Staged writes over a base store.
///
/// Reads see staged writes first. Nothing reaches the base until
/// [`OverlayKvStore::commit`], which issues one `write_batch`.
pub struct OverlayKvStore {
    base: Arc<dyn KvStore>,
    staged: Mutex<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl OverlayKvStore {
    /// Creates an empty overlay over `base`.
    pub fn new(base: Arc<dyn KvStore>) -> Self {
        Self {
            base,
            staged: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of staged keys.
    pub fn staged_len(&self) -> usize {
        self.staged.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Drains the staged writes into a batch.
    pub fn into_batch(self) -> Result<Vec<BatchOp>, MetaError> {
        let staged = self.staged.into_inner().map_err(lock_err)?;
        Ok(staged
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOp::Put { key, value },
                None => BatchOp::Delete { key },
            })
            .collect())
    }

    /// Writes every staged change to the base store atomically.
    pub fn commit(self) -> Result<(), MetaError> {
        let base = self.base.clone();
        let batch = self.into_batch()?;
        if batch.is_empty() {
            return Ok(());
        }
        base.write_batch(batch)
    }

    fn merge(
        &self,
        mut base: Vec<KvPair>,
        lo: &[u8],
        in_range: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<KvPair>, MetaError> {
        let staged = self.staged.lock().map_err(lock_err)?;
        if staged.is_empty() {
            return Ok(base);
        }
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base.drain(..).collect();
        for (k, v) in staged.range::<Vec<u8>, _>(lo.to_vec()..) {
            if !in_range(k) {
                break;
            }
            match v {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl KvStore for OverlayKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        {
            let staged = self.staged.lock().map_err(lock_err)?;
            if let Some(v) = staged.get(key) {
                return Ok(v.clone());
            }
        }
        self.base.get(key)
    }

    fn put(&self, key: Key, value: Value) -> Result<(), MetaError> {
        let mut staged = self.staged.lock().map_err(lock_err)?;
        staged.insert(key, Some(value));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        let mut staged = self.staged.lock().map_err(lock_err)?;
        staged.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let base = self.base.scan_prefix(prefix)?;
        self.merge(base, prefix, |k| k.starts_with(prefix))
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let base = self.base.scan_range(start, end)?;
        self.merge(base, start, |k| k < end)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut staged = self.staged.lock().map_err(lock_err)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    staged.insert(key, Some(value));
                }
                BatchOp::Delete { key } => {
                    staged.insert(key, None);
                }
            }
        }
        Ok(())
    }
}
