//! The central replication engine that manages all site replication.
//!
//! For every remote site the engine runs one sender task (journal tail →
//! signed batch → outbox → throttle → conduit) and one receiver task
//! (conduit → [`ReplicationEngine::receive_batch`]). Both observe a shared
//! `watch` shutdown signal at every suspension point.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use claudefs_meta::journal::MetadataJournal;
use claudefs_meta::{InodeId, MetaError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::applier::LocalApplier;
use crate::audit::{AuditEvent, AuditEventKind, AuditFilter, AuditLog};
use crate::batch_auth::{AuthResult, BatchAuthKey, BatchAuthenticator};
use crate::conduit::{BatchEnvelope, Conduit};
use crate::conflict_resolver::{ConflictAlert, ConflictResolver, Decision};
use crate::error::ReplError;
use crate::events::{EventBus, ReplEvent};
use crate::journal::{JournalTailer, ReplicatedEntry};
use crate::outbox::Outbox;
use crate::throttle::{SiteThrottle, ThrottleConfig};
use crate::wal::{ReceiveMark, ReplicationCursor, ReplicationWal};

/// Configuration for the replication engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The local site ID.
    pub local_site_id: u64,
    /// Maximum number of entries to send in a single batch.
    pub max_batch_entries: usize,
    /// Unsent batches kept per remote site before the oldest is shed.
    pub outbox_capacity: usize,
    /// Send limits applied per remote site.
    pub throttle: ThrottleConfig,
    /// Pause after a failed send before retrying.
    pub retry_backoff: Duration,
    /// Conflict alerts retained for operators.
    pub max_alerts: usize,
    /// Audit events retained.
    pub max_audit_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_site_id: 0,
            max_batch_entries: 1000,
            outbox_capacity: 64,
            throttle: ThrottleConfig::default(),
            retry_backoff: Duration::from_millis(500),
            max_alerts: 10_000,
            max_audit_events: 10_000,
        }
    }
}

/// Per-remote-site replication statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteReplicationStats {
    /// Remote site identifier.
    pub remote_site_id: u64,
    /// Total entries sent to this site.
    pub entries_sent: u64,
    /// Total batches sent to this site.
    pub batches_sent: u64,
    /// Batches dropped from the outbox before they were sent.
    pub batches_shed: u64,
    /// Failed send attempts.
    pub send_errors: u64,
    /// Last local journal sequence delivered.
    pub last_sent_seq: u64,
    /// Total batches received from this site.
    pub batches_received: u64,
    /// Batches that were already processed.
    pub batches_replayed: u64,
    /// Batches that failed authentication.
    pub batches_rejected: u64,
    /// Remote entries applied locally.
    pub entries_applied: u64,
    /// Remote entries skipped as duplicate, stale or losing a conflict.
    pub entries_skipped: u64,
    /// Remote entries refused by local validation.
    pub entries_rejected: u64,
    /// Total conflicts detected for this site.
    pub conflicts_detected: u64,
}

impl SiteReplicationStats {
    fn new(remote_site_id: u64) -> Self {
        Self {
            remote_site_id,
            ..Self::default()
        }
    }
}

/// What happened to one received batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Sending site.
    pub source_site_id: u64,
    /// Batch sequence.
    pub batch_sequence: u64,
    /// The whole batch had been processed before.
    pub replayed: bool,
    /// Entries applied locally.
    pub applied: usize,
    /// Entries skipped.
    pub skipped: usize,
    /// Entries refused by local validation.
    pub rejected: usize,
    /// Concurrent writes detected.
    pub conflicts: usize,
}

struct EngineInner {
    config: EngineConfig,
    authenticator: BatchAuthenticator,
    applier: Arc<dyn LocalApplier>,
    events: EventBus,
    resolver: Mutex<ConflictResolver>,
    wal: Mutex<ReplicationWal>,
    audit: Mutex<AuditLog>,
    site_stats: Mutex<HashMap<u64, SiteReplicationStats>>,
    /// Serializes inbound batches so clock checks and applies do not interleave.
    receive_lock: Mutex<()>,
}

/// The central replication engine.
pub struct ReplicationEngine {
    inner: Arc<EngineInner>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Create a new replication engine applying remote writes through `applier`.
    pub fn new(
        config: EngineConfig,
        key: BatchAuthKey,
        applier: Arc<dyn LocalApplier>,
        events: EventBus,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inner = EngineInner {
            authenticator: BatchAuthenticator::new(key, config.local_site_id),
            applier,
            events,
            resolver: Mutex::new(ConflictResolver::new(config.max_alerts)),
            wal: Mutex::new(ReplicationWal::new()),
            audit: Mutex::new(AuditLog::new(config.max_audit_events)),
            site_stats: Mutex::new(HashMap::new()),
            receive_lock: Mutex::new(()),
            config,
        };
        Self {
            inner: Arc::new(inner),
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// The local site ID.
    pub fn local_site_id(&self) -> u64 {
        self.inner.config.local_site_id
    }

    /// Register a remote site for replication.
    pub async fn add_site(&self, site_id: u64) {
        let mut stats = self.inner.site_stats.lock().await;
        stats
            .entry(site_id)
            .or_insert_with(|| SiteReplicationStats::new(site_id));
    }

    /// Remove a remote site and forget its progress.
    pub async fn remove_site(&self, site_id: u64) {
        self.inner.site_stats.lock().await.remove(&site_id);
        self.inner.wal.lock().await.reset(site_id);
    }

    /// Registers the conduit's site and starts its sender and receiver tasks.
    ///
    /// The sender resumes after the last journal sequence delivered to the site.
    pub async fn start_site(&self, conduit: Arc<dyn Conduit>, journal: Arc<MetadataJournal>) {
        let site_id = conduit.remote_site_id();
        self.add_site(site_id).await;
        let cursor = self.inner.wal.lock().await.cursor(site_id);
        info!(
            site_id = site_id,
            from_seq = cursor.last_seq,
            "starting replication to remote site"
        );

        let sender = SiteSender {
            inner: self.inner.clone(),
            conduit: conduit.clone(),
            site_id,
            tailer: JournalTailer::new(journal, cursor.last_seq),
            outbox: Outbox::new(self.inner.config.outbox_capacity),
            throttle: SiteThrottle::new(self.inner.config.throttle.clone()),
            next_batch_seq: cursor.last_batch + 1,
        };
        let send_task = tokio::spawn(sender.run(self.shutdown.subscribe()));
        let recv_task = tokio::spawn(run_receiver(
            self.inner.clone(),
            conduit,
            self.shutdown.subscribe(),
        ));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(send_task);
            tasks.push(recv_task);
        }
    }

    /// Signs `entries` as batch `batch_seq` from this site.
    pub fn build_batch(
        &self,
        batch_seq: u64,
        entries: Vec<ReplicatedEntry>,
    ) -> Result<BatchEnvelope, ReplError> {
        self.inner.build_batch(batch_seq, entries)
    }

    /// Authenticates, deduplicates and applies one encoded batch.
    pub async fn receive_batch(&self, frame: &[u8]) -> Result<BatchReport, ReplError> {
        self.inner.receive_batch(frame).await
    }

    /// Get per-site replication statistics.
    pub async fn site_stats(&self, site_id: u64) -> Option<SiteReplicationStats> {
        self.inner.site_stats.lock().await.get(&site_id).cloned()
    }

    /// Get all site statistics, by site.
    pub async fn all_site_stats(&self) -> Vec<SiteReplicationStats> {
        let stats = self.inner.site_stats.lock().await;
        let mut all: Vec<_> = stats.values().cloned().collect();
        all.sort_by_key(|s| s.remote_site_id);
        all
    }

    /// Retained conflict alerts, oldest first.
    pub async fn conflict_alerts(&self) -> Vec<ConflictAlert> {
        self.inner.resolver.lock().await.alerts()
    }

    /// Conflict alerts for one inode.
    pub async fn conflict_alerts_for(&self, ino: InodeId) -> Vec<ConflictAlert> {
        self.inner.resolver.lock().await.alerts_for(ino)
    }

    /// Audit events matching `filter`.
    pub async fn audit_query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.inner.audit.lock().await.query(filter)
    }

    /// Outbound progress per remote site.
    pub async fn wal_snapshot(&self) -> Vec<ReplicationCursor> {
        self.inner.wal.lock().await.all_cursors()
    }

    /// Inbound progress for one source site.
    pub async fn receive_mark(&self, source_site_id: u64) -> ReceiveMark {
        self.inner.wal.lock().await.mark(source_site_id)
    }

    /// The event bus this engine publishes on.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Signals every site task to stop and waits for them.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        info!(site_id = self.local_site_id(), "replication engine stopped");
    }
}

impl EngineInner {
    fn build_batch(
        &self,
        batch_seq: u64,
        entries: Vec<ReplicatedEntry>,
    ) -> Result<BatchEnvelope, ReplError> {
        let source = self.config.local_site_id;
        let auth_tag = self.authenticator.sign_batch(source, batch_seq, &entries)?;
        Ok(BatchEnvelope {
            source_site_id: source,
            batch_sequence: batch_seq,
            entries,
            auth_tag,
        })
    }

    async fn with_stats(&self, site_id: u64, f: impl FnOnce(&mut SiteReplicationStats)) {
        let mut stats = self.site_stats.lock().await;
        if let Some(s) = stats.get_mut(&site_id) {
            f(s);
        }
    }

    async fn receive_batch(&self, frame: &[u8]) -> Result<BatchReport, ReplError> {
        let batch = BatchEnvelope::decode(frame)?;
        let src = batch.source_site_id;
        let batch_seq = batch.batch_sequence;

        if !self.site_stats.lock().await.contains_key(&src) {
            warn!(site_id = src, batch_seq = batch_seq, "batch from unknown site dropped");
            return Err(ReplError::SiteUnknown { site_id: src });
        }

        if let AuthResult::Invalid { reason } =
            self.authenticator
                .verify_batch(&batch.auth_tag, src, batch_seq, &batch.entries)
        {
            warn!(
                site_id = src,
                batch_seq = batch_seq,
                reason = %reason,
                "batch failed authentication, dropped"
            );
            self.audit.lock().await.record(
                AuditEventKind::BatchRejected,
                src,
                format!("batch {} dropped: {}", batch_seq, reason),
            );
            self.with_stats(src, |s| s.batches_rejected += 1).await;
            self.events.publish(ReplEvent::BatchRejected {
                source_site_id: src,
                batch_seq,
            });
            return Err(ReplError::AuthenticationFailed {
                source_site_id: src,
                batch_seq,
            });
        }

        let _guard = self.receive_lock.lock().await;
        let mut report = BatchReport {
            source_site_id: src,
            batch_sequence: batch_seq,
            ..BatchReport::default()
        };

        {
            let mut wal = self.wal.lock().await;
            if let Some(epoch) = batch.entries.first().map(|e| e.epoch) {
                let known = wal.mark(src).epoch;
                match wal.observe_epoch(src, epoch) {
                    Ordering::Less => {
                        warn!(
                            site_id = src,
                            batch_seq = batch_seq,
                            epoch = epoch,
                            current_epoch = known,
                            "batch from a retired journal epoch ignored"
                        );
                        drop(wal);
                        self.with_stats(src, |s| {
                            s.batches_received += 1;
                            s.batches_replayed += 1;
                        })
                        .await;
                        report.replayed = true;
                        return Ok(report);
                    }
                    Ordering::Greater if known != 0 => {
                        info!(
                            site_id = src,
                            old_epoch = known,
                            new_epoch = epoch,
                            "source site started a new journal, receive marks reset"
                        );
                    }
                    _ => {}
                }
            }
            let mark = wal.mark(src);
            if wal.is_replayed_batch(src, batch_seq) {
                if batch
                    .entries
                    .iter()
                    .all(|e| wal.is_replayed_entry(src, e.sequence))
                {
                    debug!(site_id = src, batch_seq = batch_seq, "replayed batch ignored");
                    drop(wal);
                    self.with_stats(src, |s| {
                        s.batches_received += 1;
                        s.batches_replayed += 1;
                    })
                    .await;
                    report.replayed = true;
                    return Ok(report);
                }
                warn!(
                    site_id = src,
                    batch_seq = batch_seq,
                    last_batch = mark.batch_seq,
                    "batch sequence went backwards with new entries; sender restarted"
                );
            } else if mark.batch_seq > 0 && batch_seq > mark.batch_seq + 1 {
                warn!(
                    site_id = src,
                    expected = mark.batch_seq + 1,
                    got = batch_seq,
                    "gap in batch sequence, sender shed batches"
                );
            }
        }

        for (pos, entry) in batch.entries.iter().enumerate() {
            if self.wal.lock().await.is_replayed_entry(src, entry.sequence) {
                report.skipped += 1;
                continue;
            }
            if let Err(e) = self.receive_entry(src, entry, &mut report).await {
                // Nothing from the failed entry on counts as seen.
                self.wal
                    .lock()
                    .await
                    .record_unprocessed(src, batch.entries[pos..].iter().map(|e| e.sequence));
                warn!(
                    site_id = src,
                    batch_seq = batch_seq,
                    entry_seq = entry.sequence,
                    applied = report.applied,
                    error = %e,
                    "batch stopped at a failed entry, awaiting retransmit"
                );
                self.with_stats(src, |s| {
                    s.entries_applied += report.applied as u64;
                    s.entries_skipped += report.skipped as u64;
                    s.entries_rejected += report.rejected as u64;
                    s.conflicts_detected += report.conflicts as u64;
                })
                .await;
                return Err(e);
            }
            self.wal.lock().await.record_entry(src, entry.sequence);
        }
        self.wal.lock().await.record_batch(src, batch_seq);

        self.with_stats(src, |s| {
            s.batches_received += 1;
            s.entries_applied += report.applied as u64;
            s.entries_skipped += report.skipped as u64;
            s.entries_rejected += report.rejected as u64;
            s.conflicts_detected += report.conflicts as u64;
        })
        .await;
        debug!(
            site_id = src,
            batch_seq = batch_seq,
            applied = report.applied,
            skipped = report.skipped,
            rejected = report.rejected,
            conflicts = report.conflicts,
            "batch processed"
        );
        Ok(report)
    }

    async fn receive_entry(
        &self,
        src: u64,
        entry: &ReplicatedEntry,
        report: &mut BatchReport,
    ) -> Result<(), ReplError> {
        let Some(ino) = entry.inode() else {
            report.skipped += 1;
            return Ok(());
        };
        let local = self.applier.clock_of(ino)?;
        let decision = self.resolver.lock().await.resolve(src, ino, local, entry);

        let (conflict, alert_id) = match decision {
            Decision::Duplicate | Decision::Stale => {
                report.skipped += 1;
                return Ok(());
            }
            Decision::KeepLocal { alert_id } => {
                report.conflicts += 1;
                report.skipped += 1;
                self.alert(src, ino, alert_id, "local version kept").await;
                return Ok(());
            }
            Decision::Apply => (false, None),
            Decision::ApplyConflict { alert_id } => {
                report.conflicts += 1;
                self.alert(src, ino, alert_id, "remote version applied").await;
                (true, Some(alert_id))
            }
        };

        match self.applier.apply(entry, conflict).await {
            Ok(_) => {
                report.applied += 1;
                if let Some(alert_id) = alert_id {
                    self.audit.lock().await.record(
                        AuditEventKind::ConflictResolved,
                        src,
                        format!("alert {} on inode {}: remote version applied", alert_id, ino),
                    );
                }
                Ok(())
            }
            Err(ReplError::Meta(e)) if is_rejection(&e) => {
                report.rejected += 1;
                let (alert_id, created) = self.resolver.lock().await.record_rejection(
                    src,
                    ino,
                    local,
                    entry,
                    e.to_string(),
                    alert_id,
                );
                if created {
                    self.alert(src, ino, alert_id, "remote write rejected locally").await;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn alert(&self, src: u64, ino: InodeId, alert_id: u64, outcome: &str) {
        self.audit.lock().await.record(
            AuditEventKind::ConflictDetected,
            src,
            format!("alert {} on inode {}: {}", alert_id, ino, outcome),
        );
        self.events.publish(ReplEvent::ConflictRequiresResolution {
            site_id: src,
            inode: ino.as_u64(),
            alert_id,
        });
    }
}

fn is_rejection(e: &MetaError) -> bool {
    e.is_validation_failure() || matches!(e, MetaError::Conflict { .. })
}

/// Sending half of one remote site's replication.
struct SiteSender {
    inner: Arc<EngineInner>,
    conduit: Arc<dyn Conduit>,
    site_id: u64,
    tailer: JournalTailer,
    outbox: Outbox,
    throttle: SiteThrottle,
    next_batch_seq: u64,
}

impl SiteSender {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let limit = self.inner.config.max_batch_entries.max(1);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = if self.outbox.is_empty() {
                tokio::select! {
                    r = self.tailer.next_batch(limit) => r,
                    _ = shutdown.changed() => break,
                }
            } else {
                self.tailer.poll(limit)
            };
            match polled {
                Ok(entries) if !entries.is_empty() => {
                    if let Err(e) = self.enqueue(entries).await {
                        error!(site_id = self.site_id, error = %e, "failed to build batch");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(site_id = self.site_id, error = %e, "journal read failed");
                }
            }

            let Some(batch) = self.outbox.front().cloned() else {
                continue;
            };
            let frame = match batch.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(site_id = self.site_id, batch_seq = batch.batch_sequence, error = %e, "batch encoding failed, dropped");
                    self.outbox.pop();
                    continue;
                }
            };
            tokio::select! {
                _ = self.throttle.acquire(frame.len() as u64) => {}
                _ = shutdown.changed() => break,
            }
            let sent = tokio::select! {
                r = self.conduit.send(frame) => r,
                _ = shutdown.changed() => break,
            };
            match sent {
                Ok(()) => self.delivered(&batch).await,
                Err(ReplError::Shutdown) => break,
                Err(e) => {
                    warn!(
                        site_id = self.site_id,
                        batch_seq = batch.batch_sequence,
                        queued = self.outbox.len(),
                        error = %e,
                        "send failed, retrying after backoff"
                    );
                    self.inner.with_stats(self.site_id, |s| s.send_errors += 1).await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.inner.config.retry_backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        debug!(site_id = self.site_id, "replication sender stopped");
    }

    async fn enqueue(&mut self, entries: Vec<ReplicatedEntry>) -> Result<(), ReplError> {
        let batch = self.inner.build_batch(self.next_batch_seq, entries)?;
        self.next_batch_seq += 1;
        if let Some(shed) = self.outbox.push(batch) {
            let first = shed.entries.first().map_or(0, |e| e.sequence);
            let last = shed.entries.last().map_or(0, |e| e.sequence);
            error!(
                site_id = self.site_id,
                batch_seq = shed.batch_sequence,
                entries = shed.entries.len(),
                first_seq = first,
                last_seq = last,
                "outbox full, oldest unsent batch shed; these entries will not reach the site"
            );
            self.inner.audit.lock().await.record(
                AuditEventKind::BatchShed,
                self.site_id,
                format!(
                    "batch {} shed with entries {}..={}",
                    shed.batch_sequence, first, last
                ),
            );
            self.inner.with_stats(self.site_id, |s| s.batches_shed += 1).await;
            self.inner.events.publish(ReplEvent::BatchesShed {
                site_id: self.site_id,
                count: 1,
                last_batch_seq: shed.batch_sequence,
            });
        }
        Ok(())
    }

    async fn delivered(&mut self, batch: &BatchEnvelope) {
        self.outbox.pop();
        let last_seq = batch.entries.last().map_or(0, |e| e.sequence);
        self.inner
            .wal
            .lock()
            .await
            .advance(self.site_id, batch.batch_sequence, last_seq);
        self.inner
            .with_stats(self.site_id, |s| {
                s.batches_sent += 1;
                s.entries_sent += batch.len() as u64;
                s.last_sent_seq = s.last_sent_seq.max(last_seq);
            })
            .await;
        debug!(
            site_id = self.site_id,
            batch_seq = batch.batch_sequence,
            entries = batch.len(),
            "batch delivered"
        );
    }
}

async fn run_receiver(
    inner: Arc<EngineInner>,
    conduit: Arc<dyn Conduit>,
    mut shutdown: watch::Receiver<bool>,
) {
    let site_id = conduit.remote_site_id();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let frame: Bytes = tokio::select! {
            r = conduit.recv() => match r {
                Ok(frame) => frame,
                Err(ReplError::Shutdown) => break,
                Err(e) => {
                    warn!(site_id = site_id, error = %e, "receive failed");
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };
        match BatchEnvelope::peek_source(&frame) {
            Ok(source) if source != site_id => {
                warn!(site_id = site_id, claimed = source, "frame claims another source, dropped");
                continue;
            }
            Err(e) => {
                warn!(site_id = site_id, error = %e, "malformed frame dropped");
                continue;
            }
            Ok(_) => {}
        }
        loop {
            match inner.receive_batch(&frame).await {
                Ok(_) | Err(ReplError::AuthenticationFailed { .. }) => break,
                Err(e) if e.is_transient() => {
                    warn!(site_id = site_id, error = %e, "batch processing failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(inner.config.retry_backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    warn!(site_id = site_id, error = %e, "batch processing failed");
                    break;
                }
            }
        }
    }
    debug!(site_id = site_id, "replication receiver stopped");
}
