//! Directory entry tables.
//!
//! Entries live under `dirent/{parent_inode_be}/{entry_name}` so a prefix scan
//! returns one directory in name order. Every subdirectory also records its
//! parent under `dparent/{dir_inode_be}`, which lets renames refuse to move
//! a directory below itself.

use std::collections::HashSet;
use std::sync::Arc;

use crate::inode::{decode, encode};
use crate::kvstore::KvStore;
use crate::types::{DirEntry, FileType, InodeId, MetaError};

const DIRENT_PREFIX: &[u8] = b"dirent/";
const DPARENT_PREFIX: &[u8] = b"dparent/";

fn dparent_key(dir: InodeId) -> Vec<u8> {
    let mut key = DPARENT_PREFIX.to_vec();
    key.extend_from_slice(&dir.as_u64().to_be_bytes());
    key
}

fn dirent_prefix(parent: InodeId) -> Vec<u8> {
    let mut key = DIRENT_PREFIX.to_vec();
    key.extend_from_slice(&parent.as_u64().to_be_bytes());
    key.push(b'/');
    key
}

fn dirent_key(parent: InodeId, name: &str) -> Vec<u8> {
    let mut key = dirent_prefix(parent);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Checks a single path component.
pub fn validate_name(name: &str) -> Result<(), MetaError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.len() > 255 {
        return Err(MetaError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Name → inode bindings per directory.
///
/// Parent type checks are the caller's job; this store only enforces name
/// uniqueness.
pub struct DirectoryStore {
    kv: Arc<dyn KvStore>,
}

impl DirectoryStore {
    /// Creates a new DirectoryStore.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Inserts an entry. Fails if the name is taken.
    pub fn create_entry(&self, parent: InodeId, entry: &DirEntry) -> Result<(), MetaError> {
        let key = dirent_key(parent, &entry.name);
        if self.kv.contains_key(&key)? {
            return Err(MetaError::EntryExists {
                parent,
                name: entry.name.clone(),
            });
        }
        self.kv.put(key, encode(entry)?)?;
        if entry.file_type == FileType::Directory {
            self.set_parent(entry.ino, parent)?;
        }
        Ok(())
    }

    /// Removes an entry and returns it.
    pub fn delete_entry(&self, parent: InodeId, name: &str) -> Result<DirEntry, MetaError> {
        let entry = self.lookup(parent, name)?;
        self.kv.delete(&dirent_key(parent, name))?;
        if entry.file_type == FileType::Directory {
            self.kv.delete(&dparent_key(entry.ino))?;
        }
        Ok(entry)
    }

    fn set_parent(&self, dir: InodeId, parent: InodeId) -> Result<(), MetaError> {
        self.kv
            .put(dparent_key(dir), parent.as_u64().to_be_bytes().to_vec())
    }

    /// Directory holding the entry of subdirectory `dir`, if recorded here.
    pub fn parent_of(&self, dir: InodeId) -> Result<Option<InodeId>, MetaError> {
        match self.kv.get(&dparent_key(dir))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| MetaError::KvError("bad parent record".to_string()))?;
                Ok(Some(InodeId::new(u64::from_be_bytes(raw))))
            }
            None => Ok(None),
        }
    }

    /// True if `dir` is `ancestor` or lies somewhere below it.
    ///
    /// The walk follows recorded parents and ends at the first directory
    /// whose parent is not recorded in this store.
    pub fn is_within(&self, dir: InodeId, ancestor: InodeId) -> Result<bool, MetaError> {
        let mut seen = HashSet::new();
        let mut current = dir;
        loop {
            if current == ancestor {
                return Ok(true);
            }
            if !seen.insert(current) {
                return Ok(false);
            }
            match self.parent_of(current)? {
                Some(parent) => current = parent,
                None => return Ok(false),
            }
        }
    }

    /// Looks up an entry by name.
    pub fn lookup(&self, parent: InodeId, name: &str) -> Result<DirEntry, MetaError> {
        self.try_lookup(parent, name)?
            .ok_or_else(|| MetaError::EntryNotFound {
                parent,
                name: name.to_string(),
            })
    }

    /// Looks up an entry by name, or None if absent.
    pub fn try_lookup(&self, parent: InodeId, name: &str) -> Result<Option<DirEntry>, MetaError> {
        match self.kv.get(&dirent_key(parent, name))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Lists all entries in a directory, sorted by name.
    pub fn list_entries(&self, parent: InodeId) -> Result<Vec<DirEntry>, MetaError> {
        self.kv
            .scan_prefix(&dirent_prefix(parent))?
            .into_iter()
            .map(|(_, value)| decode(&value))
            .collect()
    }

    /// Returns true if the directory has no entries.
    pub fn is_empty(&self, parent: InodeId) -> Result<bool, MetaError> {
        Ok(self.kv.scan_prefix(&dirent_prefix(parent))?.is_empty())
    }

    /// Moves an entry, replacing any destination entry. Returns the moved
    /// entry and the replaced one.
    pub fn rename(
        &self,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> Result<(DirEntry, Option<DirEntry>), MetaError> {
        let entry = self.lookup(src_parent, src_name)?;
        let replaced = self.try_lookup(dst_parent, dst_name)?;
        self.kv.delete(&dirent_key(src_parent, src_name))?;
        let moved = DirEntry {
            name: dst_name.to_string(),
            ino: entry.ino,
            file_type: entry.file_type,
        };
        self.kv.put(dirent_key(dst_parent, dst_name), encode(&moved)?)?;
        if let Some(old) = replaced.as_ref().filter(|e| e.file_type == FileType::Directory) {
            self.kv.delete(&dparent_key(old.ino))?;
        }
        if moved.file_type == FileType::Directory {
            self.set_parent(moved.ino, dst_parent)?;
        }
        Ok((moved, replaced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryKvStore;

    fn entry(name: &str, ino: u64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            ino: InodeId::new(ino),
            file_type: FileType::RegularFile,
        }
    }

    fn make_store() -> DirectoryStore {
        DirectoryStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[test]
    fn test_create_duplicate_entry() {
        let dirs = make_store();
        dirs.create_entry(InodeId::ROOT_INODE, &entry("a", 2)).unwrap();
        assert!(matches!(
            dirs.create_entry(InodeId::ROOT_INODE, &entry("a", 3)),
            Err(MetaError::EntryExists { .. })
        ));
    }

    #[test]
    fn test_list_entries_scoped_to_parent() {
        let dirs = make_store();
        dirs.create_entry(InodeId::new(1), &entry("b", 2)).unwrap();
        dirs.create_entry(InodeId::new(1), &entry("a", 3)).unwrap();
        dirs.create_entry(InodeId::new(2), &entry("c", 4)).unwrap();

        let names: Vec<String> = dirs
            .list_entries(InodeId::new(1))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!dirs.is_empty(InodeId::new(2)).unwrap());
        assert!(dirs.is_empty(InodeId::new(3)).unwrap());
    }

    #[test]
    fn test_rename_replaces_destination() {
        let dirs = make_store();
        dirs.create_entry(InodeId::new(1), &entry("src", 5)).unwrap();
        dirs.create_entry(InodeId::new(1), &entry("dst", 6)).unwrap();

        let (moved, replaced) = dirs
            .rename(InodeId::new(1), "src", InodeId::new(1), "dst")
            .unwrap();
        assert_eq!(moved.ino, InodeId::new(5));
        assert_eq!(replaced.map(|e| e.ino), Some(InodeId::new(6)));
        assert!(dirs.try_lookup(InodeId::new(1), "src").unwrap().is_none());
        assert_eq!(
            dirs.lookup(InodeId::new(1), "dst").unwrap().ino,
            InodeId::new(5)
        );
    }

    #[test]
    fn test_parent_records_follow_directory_moves() {
        let dirs = make_store();
        let dir = |name: &str, ino: u64| DirEntry {
            name: name.to_string(),
            ino: InodeId::new(ino),
            file_type: FileType::Directory,
        };
        dirs.create_entry(InodeId::ROOT_INODE, &dir("a", 2)).unwrap();
        dirs.create_entry(InodeId::new(2), &dir("b", 3)).unwrap();
        dirs.create_entry(InodeId::new(3), &entry("f", 4)).unwrap();

        assert_eq!(dirs.parent_of(InodeId::new(3)).unwrap(), Some(InodeId::new(2)));
        assert_eq!(dirs.parent_of(InodeId::new(4)).unwrap(), None);
        assert!(dirs.is_within(InodeId::new(3), InodeId::new(2)).unwrap());
        assert!(dirs.is_within(InodeId::new(3), InodeId::ROOT_INODE).unwrap());
        assert!(!dirs.is_within(InodeId::new(2), InodeId::new(3)).unwrap());

        dirs.rename(InodeId::new(2), "b", InodeId::ROOT_INODE, "b")
            .unwrap();
        assert_eq!(
            dirs.parent_of(InodeId::new(3)).unwrap(),
            Some(InodeId::ROOT_INODE)
        );
        assert!(!dirs.is_within(InodeId::new(3), InodeId::new(2)).unwrap());

        dirs.delete_entry(InodeId::ROOT_INODE, "a").unwrap();
        assert_eq!(dirs.parent_of(InodeId::new(2)).unwrap(), None);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("file.txt").is_ok());
        for bad in ["", ".", "..", "a/b"] {
            assert!(matches!(
                validate_name(bad),
                Err(MetaError::InvalidName(_))
            ));
        }
        assert!(validate_name(&"x".repeat(256)).is_err());
    }
}
