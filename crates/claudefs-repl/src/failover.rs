//! Active-active site failover management.
//!
//! Each site moves between four modes, one level at a time, driven by
//! consecutive health check results. Mode changes are published as
//! [`ReplEvent`]s; for the local site they also set which client operations
//! the metadata service accepts. The coordinator never decides anything on
//! another site's behalf.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use claudefs_meta::{MetadataService, SiteAccess, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventKind, AuditFilter, AuditLog};
use crate::error::ReplError;
use crate::events::{EventBus, ReplEvent};

/// Site role in active-active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SiteMode {
    /// Site is fully active: accepts reads and writes.
    #[default]
    ActiveReadWrite,
    /// Site is in standby: accepts reads only.
    StandbyReadOnly,
    /// Site is degraded but still accepts writes.
    DegradedAcceptWrites,
    /// Site is offline.
    Offline,
}

impl SiteMode {
    /// One level down after repeated failed checks.
    pub fn demoted(self) -> SiteMode {
        match self {
            SiteMode::ActiveReadWrite => SiteMode::DegradedAcceptWrites,
            SiteMode::DegradedAcceptWrites | SiteMode::StandbyReadOnly | SiteMode::Offline => {
                SiteMode::Offline
            }
        }
    }

    /// One level up after repeated passing checks.
    ///
    /// A degraded site is never promoted automatically; operators return it
    /// with [`FailoverManager::force_mode`].
    pub fn promoted(self) -> SiteMode {
        match self {
            SiteMode::Offline => SiteMode::StandbyReadOnly,
            SiteMode::StandbyReadOnly | SiteMode::ActiveReadWrite => SiteMode::ActiveReadWrite,
            SiteMode::DegradedAcceptWrites => SiteMode::DegradedAcceptWrites,
        }
    }

    /// Client operations the local metadata service serves in this mode.
    pub fn site_access(self) -> SiteAccess {
        match self {
            SiteMode::ActiveReadWrite | SiteMode::DegradedAcceptWrites => SiteAccess::ReadWrite,
            SiteMode::StandbyReadOnly => SiteAccess::ReadOnly,
            SiteMode::Offline => SiteAccess::Offline,
        }
    }

    fn rank(self) -> u8 {
        match self {
            SiteMode::Offline => 0,
            SiteMode::StandbyReadOnly => 1,
            SiteMode::DegradedAcceptWrites => 2,
            SiteMode::ActiveReadWrite => 3,
        }
    }
}

/// Failover configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Number of consecutive failures before demotion.
    pub failure_threshold: u32,
    /// Number of consecutive successes before promotion.
    pub recovery_threshold: u32,
    /// Health check interval in milliseconds.
    pub check_interval_ms: u64,
    /// Time a single check may take before it counts as failed.
    pub check_timeout_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
            check_interval_ms: 5000,
            check_timeout_ms: 1000,
        }
    }
}

/// Per-site failover state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteFailoverState {
    /// Site identifier.
    pub site_id: u64,
    /// Current site mode.
    pub mode: SiteMode,
    /// Consecutive failure count.
    pub consecutive_failures: u32,
    /// Consecutive success count.
    pub consecutive_successes: u32,
    /// Time of the last health check.
    pub last_check: Option<Timestamp>,
    /// Total number of mode changes for this site.
    pub failover_count: u64,
}

impl SiteFailoverState {
    /// Create a new site failover state.
    pub fn new(site_id: u64, mode: SiteMode) -> Self {
        Self {
            site_id,
            mode,
            ..Self::default()
        }
    }

    /// Check if the site is writable.
    pub fn is_writable(&self) -> bool {
        matches!(
            self.mode,
            SiteMode::ActiveReadWrite | SiteMode::DegradedAcceptWrites
        )
    }

    /// Check if the site is readable.
    pub fn is_readable(&self) -> bool {
        !matches!(self.mode, SiteMode::Offline)
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn record_success(&mut self) {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

/// The failover manager.
pub struct FailoverManager {
    config: FailoverConfig,
    local_site_id: u64,
    sites: Mutex<HashMap<u64, SiteFailoverState>>,
    events: EventBus,
    audit: Mutex<AuditLog>,
    local_service: Option<Arc<MetadataService>>,
}

impl FailoverManager {
    /// Create a new failover manager.
    pub fn new(config: FailoverConfig, local_site_id: u64, events: EventBus) -> Self {
        Self {
            config,
            local_site_id,
            sites: Mutex::new(HashMap::new()),
            events,
            audit: Mutex::new(AuditLog::default()),
            local_service: None,
        }
    }

    /// Gates `service`'s client operations on the local site's mode.
    pub fn with_local_service(mut self, service: Arc<MetadataService>) -> Self {
        self.local_service = Some(service);
        self
    }

    /// The failover configuration.
    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    /// Register a new site for failover management.
    pub async fn register_site(&self, site_id: u64, mode: SiteMode) {
        let mut sites = self.sites.lock().await;
        if !sites.contains_key(&site_id) {
            sites.insert(site_id, SiteFailoverState::new(site_id, mode));
            drop(sites);
            self.apply_local(site_id, mode);
        }
    }

    /// Record health check result and process state transitions.
    ///
    /// Returns the events published for this check.
    pub async fn record_health(&self, site_id: u64, healthy: bool) -> Vec<ReplEvent> {
        let mut sites = self.sites.lock().await;
        let state = sites
            .entry(site_id)
            .or_insert_with(|| SiteFailoverState::new(site_id, SiteMode::default()));

        if healthy {
            state.record_success();
        } else {
            state.record_failure();
        }
        state.last_check = Some(Timestamp::now());

        let old_mode = state.mode;
        let new_mode = if state.consecutive_failures >= self.config.failure_threshold {
            old_mode.demoted()
        } else if state.consecutive_successes >= self.config.recovery_threshold {
            old_mode.promoted()
        } else {
            old_mode
        };
        debug!(
            site_id = site_id,
            healthy = healthy,
            failures = state.consecutive_failures,
            successes = state.consecutive_successes,
            mode = ?old_mode,
            "health check recorded"
        );
        if new_mode == old_mode {
            return Vec::new();
        }

        let reason = if healthy {
            format!("{} consecutive successes", state.consecutive_successes)
        } else {
            format!("{} consecutive failures", state.consecutive_failures)
        };
        state.mode = new_mode;
        state.failover_count += 1;
        state.reset_counters();
        drop(sites);

        self.changed(site_id, old_mode, new_mode, reason).await
    }

    /// Force a site into a specific mode.
    pub async fn force_mode(&self, site_id: u64, mode: SiteMode) -> Result<Vec<ReplEvent>, ReplError> {
        let mut sites = self.sites.lock().await;
        let state = sites
            .get_mut(&site_id)
            .ok_or(ReplError::SiteUnknown { site_id })?;
        let old_mode = state.mode;
        if old_mode == mode {
            return Ok(Vec::new());
        }
        state.mode = mode;
        state.failover_count += 1;
        state.reset_counters();
        drop(sites);
        Ok(self
            .changed(site_id, old_mode, mode, "forced by operator".to_string())
            .await)
    }

    async fn changed(
        &self,
        site_id: u64,
        old_mode: SiteMode,
        new_mode: SiteMode,
        reason: String,
    ) -> Vec<ReplEvent> {
        let mut events = Vec::new();
        if new_mode.rank() > old_mode.rank() {
            info!(site_id = site_id, from = ?old_mode, to = ?new_mode, reason = %reason, "site promoted");
            events.push(ReplEvent::SitePromoted { site_id, new_mode });
            if new_mode == SiteMode::ActiveReadWrite {
                events.push(ReplEvent::SiteRecovered { site_id });
            }
        } else {
            warn!(site_id = site_id, from = ?old_mode, to = ?new_mode, reason = %reason, "site demoted");
            events.push(ReplEvent::SiteDemoted {
                site_id,
                new_mode,
                reason: reason.clone(),
            });
        }
        self.audit.lock().await.record(
            AuditEventKind::SiteModeChanged,
            site_id,
            format!("{:?} -> {:?}: {}", old_mode, new_mode, reason),
        );
        self.apply_local(site_id, new_mode);
        for event in &events {
            self.events.publish(event.clone());
        }
        events
    }

    fn apply_local(&self, site_id: u64, mode: SiteMode) {
        if site_id != self.local_site_id {
            return;
        }
        if let Some(service) = &self.local_service {
            service.set_site_access(mode.site_access());
        }
    }

    /// Get the mode for a specific site.
    pub async fn site_mode(&self, site_id: u64) -> Option<SiteMode> {
        let sites = self.sites.lock().await;
        sites.get(&site_id).map(|s| s.mode)
    }

    /// Get list of writable site IDs.
    pub async fn writable_sites(&self) -> Vec<u64> {
        let sites = self.sites.lock().await;
        let mut ids: Vec<u64> = sites
            .values()
            .filter(|s| s.is_writable())
            .map(|s| s.site_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Get list of readable site IDs.
    pub async fn readable_sites(&self) -> Vec<u64> {
        let sites = self.sites.lock().await;
        let mut ids: Vec<u64> = sites
            .values()
            .filter(|s| s.is_readable())
            .map(|s| s.site_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Get failover state for one site.
    pub async fn state(&self, site_id: u64) -> Option<SiteFailoverState> {
        self.sites.lock().await.get(&site_id).cloned()
    }

    /// Get failover state for all sites.
    pub async fn all_states(&self) -> Vec<SiteFailoverState> {
        let sites = self.sites.lock().await;
        let mut states: Vec<_> = sites.values().cloned().collect();
        states.sort_by_key(|s| s.site_id);
        states
    }

    /// Mode-change audit events matching `filter`.
    pub async fn audit_query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        self.audit.lock().await.query(filter)
    }
}

/// A periodic health check of one site.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// The checked site.
    fn site_id(&self) -> u64;

    /// Returns true if the site looks healthy.
    async fn check(&self) -> bool;
}

/// Healthy if a TCP connection to the site's replication endpoint opens in time.
pub struct TcpHealthCheck {
    site_id: u64,
    addr: String,
    timeout: Duration,
}

impl TcpHealthCheck {
    /// Checks `addr` for `site_id`.
    pub fn new(site_id: u64, addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            site_id,
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthCheck for TcpHealthCheck {
    fn site_id(&self) -> u64 {
        self.site_id
    }

    async fn check(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(site_id = self.site_id, addr = %self.addr, error = %e, "health check connect failed");
                false
            }
            Err(_) => {
                debug!(site_id = self.site_id, addr = %self.addr, "health check timed out");
                false
            }
        }
    }
}

/// Healthy while no local shard has halted.
pub struct LocalServiceCheck {
    site_id: u64,
    service: Arc<MetadataService>,
}

impl LocalServiceCheck {
    /// Checks the local metadata service.
    pub fn new(service: Arc<MetadataService>) -> Self {
        Self {
            site_id: service.site_id(),
            service,
        }
    }
}

#[async_trait]
impl HealthCheck for LocalServiceCheck {
    fn site_id(&self) -> u64 {
        self.site_id
    }

    async fn check(&self) -> bool {
        let halted = self.service.raft().halted_shards();
        if !halted.is_empty() {
            debug!(site_id = self.site_id, halted = halted.len(), "local shards halted");
        }
        halted.is_empty()
    }
}

/// Checks every site each `check_interval_ms` until shutdown.
pub async fn run_health_loop(
    manager: Arc<FailoverManager>,
    checks: Vec<Arc<dyn HealthCheck>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_millis(manager.config().check_interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        for check in &checks {
            let healthy = check.check().await;
            manager.record_health(check.site_id(), healthy).await;
        }
    }
    debug!("failover health loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager() -> FailoverManager {
        FailoverManager::new(FailoverConfig::default(), 1, EventBus::default())
    }

    fn demoted(events: &[ReplEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ReplEvent::SiteDemoted { .. }))
            .count()
    }

    #[test]
    fn test_mode_ladder() {
        assert_eq!(SiteMode::ActiveReadWrite.demoted(), SiteMode::DegradedAcceptWrites);
        assert_eq!(SiteMode::DegradedAcceptWrites.demoted(), SiteMode::Offline);
        assert_eq!(SiteMode::StandbyReadOnly.demoted(), SiteMode::Offline);
        assert_eq!(SiteMode::Offline.promoted(), SiteMode::StandbyReadOnly);
        assert_eq!(SiteMode::StandbyReadOnly.promoted(), SiteMode::ActiveReadWrite);
        assert_eq!(SiteMode::DegradedAcceptWrites.promoted(), SiteMode::DegradedAcceptWrites);
        assert_eq!(SiteMode::StandbyReadOnly.site_access(), SiteAccess::ReadOnly);
        assert_eq!(SiteMode::DegradedAcceptWrites.site_access(), SiteAccess::ReadWrite);
    }

    #[tokio::test]
    async fn test_failure_threshold_boundary() {
        let m = manager();
        m.register_site(2, SiteMode::ActiveReadWrite).await;
        assert!(m.record_health(2, false).await.is_empty());
        assert!(m.record_health(2, false).await.is_empty());
        assert_eq!(m.site_mode(2).await, Some(SiteMode::ActiveReadWrite));

        let events = m.record_health(2, false).await;
        assert_eq!(demoted(&events), 1);
        assert_eq!(m.site_mode(2).await, Some(SiteMode::DegradedAcceptWrites));
        let state = m.state(2).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.failover_count, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let m = manager();
        m.register_site(2, SiteMode::ActiveReadWrite).await;
        m.record_health(2, false).await;
        m.record_health(2, false).await;
        m.record_health(2, true).await;
        m.record_health(2, false).await;
        m.record_health(2, false).await;
        assert_eq!(m.site_mode(2).await, Some(SiteMode::ActiveReadWrite));
    }

    #[tokio::test]
    async fn test_recovery_from_offline() {
        let m = manager();
        m.register_site(2, SiteMode::Offline).await;
        assert!(m.record_health(2, true).await.is_empty());
        let events = m.record_health(2, true).await;
        assert_eq!(
            events,
            vec![ReplEvent::SitePromoted {
                site_id: 2,
                new_mode: SiteMode::StandbyReadOnly
            }]
        );
        assert!(m.record_health(2, true).await.is_empty());
        let events = m.record_health(2, true).await;
        assert!(events.contains(&ReplEvent::SiteRecovered { site_id: 2 }));
        assert_eq!(m.site_mode(2).await, Some(SiteMode::ActiveReadWrite));
    }

    #[tokio::test]
    async fn test_standby_failure_to_offline() {
        let m = manager();
        m.register_site(2, SiteMode::StandbyReadOnly).await;
        for _ in 0..3 {
            m.record_health(2, false).await;
        }
        assert_eq!(m.site_mode(2).await, Some(SiteMode::Offline));
        // offline stays offline
        for _ in 0..5 {
            assert!(m.record_health(2, false).await.is_empty());
        }
        assert_eq!(m.readable_sites().await, Vec::<u64>::new());
    }

    #[tokio::test]
    async fn test_force_mode() {
        let m = manager();
        assert!(matches!(
            m.force_mode(9, SiteMode::Offline).await,
            Err(ReplError::SiteUnknown { site_id: 9 })
        ));
        m.register_site(2, SiteMode::DegradedAcceptWrites).await;
        let events = m.force_mode(2, SiteMode::ActiveReadWrite).await.unwrap();
        assert!(events.contains(&ReplEvent::SiteRecovered { site_id: 2 }));
        assert!(m.force_mode(2, SiteMode::ActiveReadWrite).await.unwrap().is_empty());
        assert_eq!(
            m.audit_query(&AuditFilter::kind(AuditEventKind::SiteModeChanged))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_events_published_on_bus() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let m = FailoverManager::new(
            FailoverConfig {
                failure_threshold: 1,
                ..FailoverConfig::default()
            },
            1,
            bus,
        );
        m.register_site(3, SiteMode::ActiveReadWrite).await;
        m.record_health(3, false).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ReplEvent::SiteDemoted {
                site_id: 3,
                new_mode: SiteMode::DegradedAcceptWrites,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_writable_and_readable_sites() {
        let m = manager();
        m.register_site(1, SiteMode::ActiveReadWrite).await;
        m.register_site(2, SiteMode::StandbyReadOnly).await;
        m.register_site(3, SiteMode::Offline).await;
        m.register_site(4, SiteMode::DegradedAcceptWrites).await;
        assert_eq!(m.writable_sites().await, vec![1, 4]);
        assert_eq!(m.readable_sites().await, vec![1, 2, 4]);
    }

    struct FlagCheck {
        site_id: u64,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl HealthCheck for FlagCheck {
        fn site_id(&self) -> u64 {
            self.site_id
        }

        async fn check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_demotes_unhealthy_site() {
        let m = Arc::new(FailoverManager::new(
            FailoverConfig {
                check_interval_ms: 100,
                ..FailoverConfig::default()
            },
            1,
            EventBus::default(),
        ));
        m.register_site(2, SiteMode::ActiveReadWrite).await;
        let check: Arc<dyn HealthCheck> = Arc::new(FlagCheck {
            site_id: 2,
            healthy: AtomicBool::new(false),
        });
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run_health_loop(m.clone(), vec![check], rx));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(m.site_mode(2).await, Some(SiteMode::DegradedAcceptWrites));

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_health_check_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let check = TcpHealthCheck::new(2, addr.clone(), Duration::from_secs(1));
        assert!(check.check().await);
        drop(listener);
        let check = TcpHealthCheck::new(2, addr, Duration::from_secs(1));
        assert!(!check.check().await);
    }
}
