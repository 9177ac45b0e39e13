//! Extended attributes, stored under `xattr/{inode_be}/{key}`.

use std::sync::Arc;

use crate::kvstore::KvStore;
use crate::types::{InodeId, MetaError};

const XATTR_PREFIX: &[u8] = b"xattr/";

fn xattr_prefix(ino: InodeId) -> Vec<u8> {
    let mut key = XATTR_PREFIX.to_vec();
    key.extend_from_slice(&ino.as_u64().to_be_bytes());
    key.push(b'/');
    key
}

fn xattr_key(ino: InodeId, name: &str) -> Vec<u8> {
    let mut key = xattr_prefix(ino);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Per-inode extended attribute table.
pub struct XattrStore {
    kv: Arc<dyn KvStore>,
}

impl XattrStore {
    /// Creates a new XattrStore.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Sets (or overwrites) an attribute.
    pub fn set(&self, ino: InodeId, name: &str, value: &[u8]) -> Result<(), MetaError> {
        self.kv.put(xattr_key(ino, name), value.to_vec())
    }

    /// Gets an attribute value.
    pub fn get(&self, ino: InodeId, name: &str) -> Result<Vec<u8>, MetaError> {
        self.kv
            .get(&xattr_key(ino, name))?
            .ok_or_else(|| MetaError::XattrNotFound {
                ino,
                key: name.to_string(),
            })
    }

    /// Lists attribute names in sorted order.
    pub fn list(&self, ino: InodeId) -> Result<Vec<String>, MetaError> {
        let prefix = xattr_prefix(ino);
        self.kv
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(key, _)| {
                String::from_utf8(key[prefix.len()..].to_vec())
                    .map_err(|e| MetaError::KvError(e.to_string()))
            })
            .collect()
    }

    /// Removes an attribute. Fails if it does not exist.
    pub fn remove(&self, ino: InodeId, name: &str) -> Result<(), MetaError> {
        let key = xattr_key(ino, name);
        if !self.kv.contains_key(&key)? {
            return Err(MetaError::XattrNotFound {
                ino,
                key: name.to_string(),
            });
        }
        self.kv.delete(&key)
    }

    /// Drops every attribute of an inode.
    pub fn remove_all(&self, ino: InodeId) -> Result<(), MetaError> {
        for (key, _) in self.kv.scan_prefix(&xattr_prefix(ino))? {
            self.kv.delete(&key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;

    fn make_store() -> XattrStore {
        XattrStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_set_get_overwrite() {
        let store = make_store();
        let ino = InodeId::new(42);
        store.set(ino, "user.v", b"v1").unwrap();
        store.set(ino, "user.v", b"v2").unwrap();
        assert_eq!(store.get(ino, "user.v").unwrap(), b"v2");
    }

    #[test]
    fn test_missing_xattr() {
        let store = make_store();
        assert!(matches!(
            store.get(InodeId::new(42), "user.missing"),
            Err(MetaError::XattrNotFound { .. })
        ));
        assert!(matches!(
            store.remove(InodeId::new(42), "user.missing"),
            Err(MetaError::XattrNotFound { .. })
        ));
    }

    #[test]
    fn test_list_and_remove_all() {
        let store = make_store();
        let ino = InodeId::new(42);
        store.set(ino, "user.b", b"1").unwrap();
        store.set(ino, "claudefs.tier", b"flash").unwrap();
        store.set(InodeId::new(43), "user.a", b"2").unwrap();

        assert_eq!(store.list(ino).unwrap(), vec!["claudefs.tier", "user.b"]);
        store.remove_all(ino).unwrap();
        assert!(store.list(ino).unwrap().is_empty());
        assert_eq!(store.list(InodeId::new(43)).unwrap(), vec!["user.a"]);
    }
}
