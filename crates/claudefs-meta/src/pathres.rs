//! Speculative path resolution with positive and negative caching.
//!
//! The cache maps `(parent, name)` to the resolved inode. Positive entries
//! are evicted least-recently-used; negative entries ("name does not exist")
//! expire after a TTL. The coordinator invalidates both whenever a committed
//! entry touches the name, so a hit is never older than the last commit
//! acknowledged to a client.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::*;

/// Cache entry for a resolved path component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathCacheEntry {
    /// The resolved inode ID.
    pub ino: InodeId,
    /// The file type.
    pub file_type: FileType,
    /// The shard this inode belongs to.
    pub shard: ShardId,
}

/// Path cache sizing.
#[derive(Clone, Debug)]
pub struct PathCacheConfig {
    /// Maximum positive entries before LRU eviction.
    pub max_entries: usize,
    /// Maximum negative entries.
    pub max_negative_entries: usize,
    /// Lifetime of a negative entry.
    pub negative_ttl: Duration,
}

impl Default for PathCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 65_536,
            max_negative_entries: 16_384,
            negative_ttl: Duration::from_secs(5),
        }
    }
}

type Key = (InodeId, String);

#[derive(Default)]
struct CacheState {
    positive: HashMap<Key, (PathCacheEntry, u64)>,
    lru: BTreeMap<u64, Key>,
    negative: HashMap<Key, Instant>,
    clock: u64,
}

impl CacheState {
    fn touch(&mut self, key: &Key) {
        self.clock += 1;
        let clock = self.clock;
        if let Some((_, used)) = self.positive.get_mut(key) {
            self.lru.remove(used);
            *used = clock;
            self.lru.insert(clock, key.clone());
        }
    }

    fn remove_positive(&mut self, key: &Key) -> bool {
        match self.positive.remove(key) {
            Some((_, used)) => {
                self.lru.remove(&used);
                true
            }
            None => false,
        }
    }
}

/// Outcome of walking a path through the cache alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpeculativeResolution {
    /// Components found in the cache, in path order.
    pub resolved: Vec<PathCacheEntry>,
    /// Components that still need an authoritative lookup.
    pub remaining: Vec<String>,
}

/// Speculative path resolution with caching.
pub struct PathResolver {
    num_shards: u16,
    config: PathCacheConfig,
    state: Mutex<CacheState>,
}

impl PathResolver {
    /// Create a new path resolver.
    pub fn new(num_shards: u16, config: PathCacheConfig) -> Self {
        Self {
            num_shards,
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn state(&self) -> Option<std::sync::MutexGuard<'_, CacheState>> {
        self.state.lock().ok()
    }

    /// Splits a path into components, ignoring empty and "." components.
    pub fn parse_path(path: &str) -> Vec<String> {
        path.split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .map(str::to_string)
            .collect()
    }

    /// Walks the cache from the root as far as it can.
    pub fn speculative_resolve(&self, path: &str) -> SpeculativeResolution {
        let components = Self::parse_path(path);
        let mut out = SpeculativeResolution::default();
        let Some(mut state) = self.state() else {
            out.remaining = components;
            return out;
        };
        let mut parent = InodeId::ROOT_INODE;
        for (i, component) in components.iter().enumerate() {
            let key = (parent, component.clone());
            match state.positive.get(&key).map(|(e, _)| e.clone()) {
                Some(entry) => {
                    state.touch(&key);
                    parent = entry.ino;
                    out.resolved.push(entry);
                }
                None => {
                    out.remaining = components[i..].to_vec();
                    break;
                }
            }
        }
        out
    }

    /// Cached resolution of one component, if present.
    pub fn cached(&self, parent: InodeId, name: &str) -> Option<PathCacheEntry> {
        let mut state = self.state()?;
        let key = (parent, name.to_string());
        let entry = state.positive.get(&key).map(|(e, _)| e.clone())?;
        state.touch(&key);
        Some(entry)
    }

    /// Records a resolved component.
    pub fn cache_resolution(&self, parent: InodeId, name: &str, entry: PathCacheEntry) {
        let Some(mut state) = self.state() else {
            return;
        };
        let key = (parent, name.to_string());
        state.negative.remove(&key);
        if !state.positive.contains_key(&key) {
            while state.positive.len() >= self.config.max_entries.max(1) {
                let Some((_, oldest)) = state.lru.pop_first() else {
                    break;
                };
                state.positive.remove(&oldest);
            }
        }
        state.clock += 1;
        let clock = state.clock;
        if let Some((_, used)) = state.positive.insert(key.clone(), (entry, clock)) {
            state.lru.remove(&used);
        }
        state.lru.insert(clock, key);
    }

    /// Records that `name` does not exist under `parent`.
    pub fn cache_negative(&self, parent: InodeId, name: &str) {
        let Some(mut state) = self.state() else {
            return;
        };
        let key = (parent, name.to_string());
        if !state.negative.contains_key(&key)
            && state.negative.len() >= self.config.max_negative_entries.max(1)
        {
            // drop the entry closest to expiry
            let oldest = state
                .negative
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                state.negative.remove(&oldest);
            }
        }
        state.negative.insert(key, Instant::now());
    }

    /// True if a live negative entry exists.
    pub fn check_negative(&self, parent: InodeId, name: &str) -> bool {
        let ttl = self.config.negative_ttl;
        self.state()
            .and_then(|s| s.negative.get(&(parent, name.to_string())).copied())
            .is_some_and(|at| at.elapsed() < ttl)
    }

    /// Drops positive and negative entries for one name.
    pub fn invalidate_entry(&self, parent: InodeId, name: &str) -> bool {
        let Some(mut state) = self.state() else {
            return false;
        };
        let key = (parent, name.to_string());
        let positive = state.remove_positive(&key);
        let negative = state.negative.remove(&key).is_some();
        positive || negative
    }

    /// Drops every positive entry that resolves to `ino`, and everything cached beneath it.
    pub fn invalidate_inode(&self, ino: InodeId) -> usize {
        let Some(mut state) = self.state() else {
            return 0;
        };
        let keys: Vec<Key> = state
            .positive
            .iter()
            .filter(|((parent, _), (entry, _))| entry.ino == ino || *parent == ino)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            state.remove_positive(key);
        }
        state.negative.retain(|(parent, _), _| *parent != ino);
        keys.len()
    }

    /// Removes expired negative entries; returns how many.
    pub fn cleanup_expired_negative(&self) -> usize {
        let ttl = self.config.negative_ttl;
        let Some(mut state) = self.state() else {
            return 0;
        };
        let before = state.negative.len();
        state.negative.retain(|_, at| at.elapsed() < ttl);
        before - state.negative.len()
    }

    /// Positive cache size.
    pub fn cache_size(&self) -> usize {
        self.state().map(|s| s.positive.len()).unwrap_or(0)
    }

    /// Negative cache size.
    pub fn negative_cache_size(&self) -> usize {
        self.state().map(|s| s.negative.len()).unwrap_or(0)
    }

    /// Resolves a path, consulting the caches first and `lookup` for misses.
    ///
    /// Successful lookups populate the positive cache; `EntryNotFound`
    /// populates the negative cache.
    pub fn resolve_path<F>(&self, path: &str, lookup: F) -> Result<InodeId, MetaError>
    where
        F: Fn(InodeId, &str) -> Result<DirEntry, MetaError>,
    {
        let mut parent = InodeId::ROOT_INODE;
        for component in Self::parse_path(path) {
            if component == ".." {
                return Err(MetaError::InvalidName(component));
            }
            if self.check_negative(parent, &component) {
                return Err(MetaError::EntryNotFound {
                    parent,
                    name: component,
                });
            }
            if let Some(cached) = self.cached(parent, &component) {
                parent = cached.ino;
                continue;
            }
            match lookup(parent, &component) {
                Ok(entry) => {
                    self.cache_resolution(
                        parent,
                        &component,
                        PathCacheEntry {
                            ino: entry.ino,
                            file_type: entry.file_type,
                            shard: entry.ino.shard(self.num_shards),
                        },
                    );
                    parent = entry.ino;
                }
                Err(e) => {
                    if matches!(e, MetaError::EntryNotFound { .. }) {
                        self.cache_negative(parent, &component);
                    }
                    return Err(e);
                }
            }
        }
        Ok(parent)
    }
}
