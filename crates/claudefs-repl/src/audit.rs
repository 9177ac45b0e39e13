//! Audit trail for replication events.

use std::collections::VecDeque;

use claudefs_meta::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Kinds of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventKind {
    /// A batch failed authentication and was dropped.
    BatchRejected,
    /// An unsent batch was dropped from a full outbox.
    BatchShed,
    /// Concurrent writes to one inode were detected.
    ConflictDetected,
    /// A conflict was settled and the winner applied or kept.
    ConflictResolved,
    /// A site changed failover mode.
    SiteModeChanged,
}

/// An audit event recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique identifier for this event.
    pub event_id: u64,
    /// The kind of event.
    pub kind: AuditEventKind,
    /// The site associated with this event.
    pub site_id: u64,
    /// Wall-clock time of the event.
    pub timestamp: Timestamp,
    /// Additional details about the event.
    pub details: String,
}

/// Filter for querying audit events.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Filter by event kind.
    pub kind: Option<AuditEventKind>,
    /// Filter by site ID.
    pub site_id: Option<u64>,
    /// Filter events from this time (inclusive).
    pub since: Option<Timestamp>,
    /// Filter events until this time (inclusive).
    pub until: Option<Timestamp>,
}

impl AuditFilter {
    /// Matches one kind of event.
    pub fn kind(kind: AuditEventKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    fn matches(&self, e: &AuditEvent) -> bool {
        self.kind.map_or(true, |k| e.kind == k)
            && self.site_id.map_or(true, |s| e.site_id == s)
            && self.since.map_or(true, |t| e.timestamp >= t)
            && self.until.map_or(true, |t| e.timestamp <= t)
    }
}

/// Bounded audit log; the oldest events are dropped first.
#[derive(Debug)]
pub struct AuditLog {
    events: VecDeque<AuditEvent>,
    max_events: usize,
    next_id: u64,
}

impl AuditLog {
    /// Create an empty audit log retaining at most `max_events` events.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            max_events: max_events.max(1),
            next_id: 0,
        }
    }

    /// Record a new audit event stamped with the current time.
    pub fn record(&mut self, kind: AuditEventKind, site_id: u64, details: impl Into<String>) -> u64 {
        self.record_at(kind, site_id, Timestamp::now(), details)
    }

    /// Record a new audit event. Returns the event ID.
    pub fn record_at(
        &mut self,
        kind: AuditEventKind,
        site_id: u64,
        timestamp: Timestamp,
        details: impl Into<String>,
    ) -> u64 {
        let event_id = self.next_id;
        self.next_id += 1;
        info!(event_id = event_id, kind = ?kind, site_id = site_id, "audit event recorded");
        self.events.push_back(AuditEvent {
            event_id,
            kind,
            site_id,
            timestamp,
            details: details.into(),
        });
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
        event_id
    }

    /// Events matching every set filter field, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// The `n` most recent events.
    pub fn latest_n(&self, n: usize) -> Vec<AuditEvent> {
        let start = self.events.len().saturating_sub(n);
        self.events.iter().skip(start).cloned().collect()
    }

    /// Number of retained events.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Drops events older than `before`.
    pub fn clear_before(&mut self, before: Timestamp) {
        let original_len = self.events.len();
        self.events.retain(|e| e.timestamp >= before);
        let removed = original_len - self.events.len();
        if removed > 0 {
            info!(removed_events = removed, "audit log GC completed");
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}
