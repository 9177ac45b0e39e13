//! Lease-based metadata caching protocol.
//!
//! Clients take leases on inodes so they can serve stat/readdir from local
//! cache. Any committed change to a leased inode revokes every lease on it
//! before the change is acknowledged. Leases are advisory: they never gate
//! consensus, they only tell clients when their cache went stale.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::*;

/// Type of metadata lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseType {
    /// Shared: any number of readers may cache.
    Read,
    /// Single writer; coexists with readers.
    Write,
    /// Sole holder; excludes every other lease.
    Exclusive,
}

impl LeaseType {
    fn compatible_with(self, other: LeaseType) -> bool {
        match (self, other) {
            (LeaseType::Exclusive, _) | (_, LeaseType::Exclusive) => false,
            (LeaseType::Write, LeaseType::Write) => false,
            _ => true,
        }
    }
}

/// A metadata lease granted to a client.
#[derive(Clone, Debug)]
pub struct Lease {
    /// Unique lease ID.
    pub lease_id: u64,
    /// The inode being leased.
    pub ino: InodeId,
    /// The client that holds the lease.
    pub client: NodeId,
    /// Type of lease.
    pub lease_type: LeaseType,
    /// When the lease expires.
    pub expires_at: Instant,
}

#[derive(Default)]
struct LeaseTable {
    by_id: HashMap<u64, Lease>,
    by_inode: HashMap<InodeId, HashSet<u64>>,
    by_client: HashMap<NodeId, HashSet<u64>>,
    next_id: u64,
}

impl LeaseTable {
    fn remove(&mut self, lease_id: u64) -> Option<Lease> {
        let lease = self.by_id.remove(&lease_id)?;
        if let Some(ids) = self.by_inode.get_mut(&lease.ino) {
            ids.remove(&lease_id);
            if ids.is_empty() {
                self.by_inode.remove(&lease.ino);
            }
        }
        if let Some(ids) = self.by_client.get_mut(&lease.client) {
            ids.remove(&lease_id);
            if ids.is_empty() {
                self.by_client.remove(&lease.client);
            }
        }
        Some(lease)
    }

    fn live_on(&self, ino: InodeId, now: Instant) -> impl Iterator<Item = &Lease> {
        self.by_inode
            .get(&ino)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
            .filter(move |l| l.expires_at > now)
    }
}

/// Manages metadata leases for distributed caching.
pub struct LeaseManager {
    duration: Duration,
    table: Mutex<LeaseTable>,
}

impl LeaseManager {
    /// Create a new lease manager with the given lease duration.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            table: Mutex::new(LeaseTable {
                next_id: 1,
                ..LeaseTable::default()
            }),
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, LeaseTable>, MetaError> {
        self.table
            .lock()
            .map_err(|e| MetaError::KvError(format!("lease table poisoned: {}", e)))
    }

    /// Grants a lease, or `PermissionDenied` if a conflicting live lease exists.
    ///
    /// A client's own leases never conflict with its new request.
    pub fn grant(&self, ino: InodeId, client: NodeId, lease_type: LeaseType) -> Result<Lease, MetaError> {
        let now = Instant::now();
        let mut table = self.table()?;
        let conflict = table
            .live_on(ino, now)
            .any(|l| l.client != client && !l.lease_type.compatible_with(lease_type));
        if conflict {
            tracing::debug!(ino = %ino, client = %client, ?lease_type, "lease conflict");
            return Err(MetaError::PermissionDenied);
        }

        let lease_id = table.next_id;
        table.next_id += 1;
        let lease = Lease {
            lease_id,
            ino,
            client,
            lease_type,
            expires_at: now + self.duration,
        };
        table.by_id.insert(lease_id, lease.clone());
        table.by_inode.entry(ino).or_default().insert(lease_id);
        table.by_client.entry(client).or_default().insert(lease_id);
        Ok(lease)
    }

    /// Extends a live lease by another full duration.
    pub fn renew(&self, lease_id: u64) -> Result<Lease, MetaError> {
        let now = Instant::now();
        let mut table = self.table()?;
        let lease = table
            .by_id
            .get_mut(&lease_id)
            .filter(|l| l.expires_at > now)
            .ok_or(MetaError::PermissionDenied)?;
        lease.expires_at = now + self.duration;
        Ok(lease.clone())
    }

    /// Releases a lease held by `client`.
    pub fn release(&self, lease_id: u64, client: NodeId) -> Result<(), MetaError> {
        let mut table = self.table()?;
        let held = table
            .by_id
            .get(&lease_id)
            .is_some_and(|l| l.client == client);
        if !held {
            return Err(MetaError::PermissionDenied);
        }
        table.remove(lease_id);
        Ok(())
    }

    /// Revokes every lease on an inode; returns the revoked leases.
    pub fn revoke(&self, ino: InodeId) -> Vec<Lease> {
        let Ok(mut table) = self.table() else {
            return Vec::new();
        };
        let ids: Vec<u64> = table
            .by_inode
            .get(&ino)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| table.remove(id)).collect()
    }

    /// Revokes every lease held by a client, e.g. when it disconnects.
    pub fn revoke_client(&self, client: NodeId) -> usize {
        let Ok(mut table) = self.table() else {
            return 0;
        };
        let ids: Vec<u64> = table
            .by_client
            .get(&client)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| table.remove(id)).count()
    }

    /// Drops expired leases; returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut table) = self.table() else {
            return 0;
        };
        let expired: Vec<u64> = table
            .by_id
            .values()
            .filter(|l| l.expires_at <= now)
            .map(|l| l.lease_id)
            .collect();
        let count = expired.len();
        for id in expired {
            table.remove(id);
        }
        if count > 0 {
            tracing::debug!(count, "expired leases removed");
        }
        count
    }

    /// Live leases on an inode.
    pub fn leases_on(&self, ino: InodeId) -> Vec<Lease> {
        let now = Instant::now();
        self.table()
            .map(|t| t.live_on(ino, now).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of leases currently tracked, live or not yet swept.
    pub fn active_lease_count(&self) -> usize {
        self.table().map(|t| t.by_id.len()).unwrap_or(0)
    }
}
