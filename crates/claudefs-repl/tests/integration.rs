//! Cross-site replication and failover scenarios between two in-process sites.

mod common;

use std::time::Duration;

use claudefs_meta::types::*;
use claudefs_meta::SiteAccess;
use claudefs_repl::audit::{AuditEventKind, AuditFilter};
use claudefs_repl::conflict_resolver::{AlertReason, Winner};
use claudefs_repl::failover::{FailoverConfig, FailoverManager, SiteMode};
use claudefs_repl::throttle::ThrottleConfig;
use claudefs_repl::{EngineConfig, ReplError, ReplEvent};
use common::{connect, eventually, ship, two_sites, TestSite};

fn drain_conflict_events(rx: &mut tokio::sync::broadcast::Receiver<ReplEvent>) -> Vec<ReplEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if matches!(event, ReplEvent::ConflictRequiresResolution { .. }) {
            out.push(event);
        }
    }
    out
}

#[tokio::test]
async fn test_remote_create_is_visible_with_origin_clock() {
    let (a, b) = two_sites(EngineConfig::default()).await;
    let file = a.service.create(InodeId::ROOT_INODE, "f", 0, 0, 0o644).await.unwrap();

    let (_, report) = ship(&a, &b, 0, 1).await;
    let report = report.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.conflicts, 0);

    let remote = b.service.getattr(file.ino).unwrap();
    assert_eq!(remote.vector_clock, a.service.getattr(file.ino).unwrap().vector_clock);
    assert_eq!(b.service.lookup(InodeId::ROOT_INODE, "f").unwrap().ino, file.ino);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_setattr_resolved_by_last_writer() {
    let (a, b) = two_sites(EngineConfig::default()).await;
    let file = a.service.create(InodeId::ROOT_INODE, "f", 0, 0, 0o644).await.unwrap();
    ship(&a, &b, 0, 1).await.1.unwrap();
    let (a_pos, b_pos) = (a.journal_position(), b.journal_position());
    let mut a_events = a.events.subscribe();
    let mut b_events = b.events.subscribe();

    let mut attr = a.service.getattr(file.ino).unwrap();
    attr.mode = 0o600;
    let a_attr = a.service.setattr(file.ino, attr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let mut attr = b.service.getattr(file.ino).unwrap();
    attr.mode = 0o640;
    let b_attr = b.service.setattr(file.ino, attr).await.unwrap();
    assert!(b_attr.ctime > a_attr.ctime);

    // B wrote last and keeps its version
    let report = ship(&a, &b, a_pos, 2).await.1.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 0);
    assert_eq!(b.service.getattr(file.ino).unwrap().mode, 0o640);

    // A adopts B's version
    let report = ship(&b, &a, b_pos, 1).await.1.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(a.service.getattr(file.ino).unwrap().mode, 0o640);

    for (site, local_attr, remote_attr, expected) in [
        (&b, &b_attr, &a_attr, Winner::Local),
        (&a, &a_attr, &b_attr, Winner::Remote),
    ] {
        let alerts = site.engine.conflict_alerts().await;
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.inode, file.ino);
        assert_eq!(alert.reason, AlertReason::ConcurrentWrite);
        assert_eq!(alert.winner, expected);
        assert_eq!(alert.local.as_ref().unwrap().clock, local_attr.vector_clock);
        assert_eq!(alert.local.as_ref().unwrap().timestamp, local_attr.ctime);
        assert_eq!(alert.remote.clock, remote_attr.vector_clock);
        assert_eq!(alert.remote.timestamp, remote_attr.ctime);
    }
    assert_eq!(drain_conflict_events(&mut a_events).len(), 1);
    assert_eq!(drain_conflict_events(&mut b_events).len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_set_xattr_resolved_by_later_write() {
    let (a, b) = two_sites(EngineConfig::default()).await;
    let file = a.service.create(InodeId::ROOT_INODE, "f", 0, 0, 0o644).await.unwrap();
    ship(&a, &b, 0, 1).await.1.unwrap();
    let created = b.service.getattr(file.ino).unwrap().ctime;
    let (a_pos, b_pos) = (a.journal_position(), b.journal_position());

    a.service.set_xattr(file.ino, "user.tag", b"from-a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    b.service.set_xattr(file.ino, "user.tag", b"from-b").await.unwrap();

    // each write moved the change time the resolver compares
    let a_attr = a.service.getattr(file.ino).unwrap();
    let b_attr = b.service.getattr(file.ino).unwrap();
    assert!(a_attr.ctime > created);
    assert!(b_attr.ctime > a_attr.ctime);
    let shipped = a.local_entries(a_pos);
    assert_eq!(shipped.len(), 1);
    assert_eq!(shipped[0].committed_at, a_attr.ctime);

    let report = ship(&a, &b, a_pos, 2).await.1.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 0);
    let report = ship(&b, &a, b_pos, 1).await.1.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.applied, 1);

    for site in [&a, &b] {
        assert_eq!(site.service.get_xattr(file.ino, "user.tag").unwrap(), b"from-b".to_vec());
    }
    assert_eq!(a.service.getattr(file.ino).unwrap().ctime, b_attr.ctime);
    let alerts = a.engine.conflict_alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].winner, Winner::Remote);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_replayed_batch_changes_nothing() {
    let (a, b) = two_sites(EngineConfig::default()).await;
    let file = a.service.create(InodeId::ROOT_INODE, "f", 0, 0, 0o644).await.unwrap();
    let (frame, report) = ship(&a, &b, 0, 1).await;
    assert_eq!(report.unwrap().applied, 2);

    let mut attr = b.service.getattr(file.ino).unwrap();
    attr.mode = 0o600;
    b.service.setattr(file.ino, attr).await.unwrap();
    let before = b.fingerprint();
    let last_applied = b.service.raft().state_machine(common::SHARD).unwrap().last_applied();
    let alerts = b.engine.conflict_alerts().await.len();

    let report = b.engine.receive_batch(&frame).await.unwrap();
    assert!(report.replayed);
    assert_eq!(report.applied, 0);
    assert_eq!(b.fingerprint(), before);
    assert_eq!(
        b.service.raft().state_machine(common::SHARD).unwrap().last_applied(),
        last_applied
    );
    assert_eq!(b.engine.conflict_alerts().await.len(), alerts);
    assert_eq!(b.engine.site_stats(1).await.unwrap().batches_replayed, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_tampered_batch_is_dropped() {
    let (a, b) = two_sites(EngineConfig::default()).await;
    a.service.create(InodeId::ROOT_INODE, "f", 0, 0, 0o644).await.unwrap();
    let before = b.fingerprint();

    let mut batch = a.batch(0, 1);
    batch.entries[0].committed_at = Timestamp::new(1, 0);
    let err = b.engine.receive_batch(&batch.encode().unwrap()).await.unwrap_err();
    assert!(matches!(
        err,
        ReplError::AuthenticationFailed {
            source_site_id: 1,
            batch_seq: 1
        }
    ));
    assert_eq!(b.fingerprint(), before);
    assert_eq!(
        b.engine
            .audit_query(&AuditFilter::kind(AuditEventKind::BatchRejected))
            .await
            .len(),
        1
    );

    // the genuine batch is still accepted
    let report = ship(&a, &b, 0, 1).await.1.unwrap();
    assert_eq!(report.applied, 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_failover_thresholds_gate_local_service() {
    let a = TestSite::start(1, true, EngineConfig::default()).await;
    let mut rx = a.events.subscribe();
    let failover = FailoverManager::new(FailoverConfig::default(), 1, a.events.clone())
        .with_local_service(a.service.clone());
    failover.register_site(1, SiteMode::ActiveReadWrite).await;

    for _ in 0..2 {
        assert!(failover.record_health(1, false).await.is_empty());
    }
    let events = failover.record_health(1, false).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        ReplEvent::SiteDemoted {
            site_id: 1,
            new_mode: SiteMode::DegradedAcceptWrites,
            ..
        }
    ));
    assert!(matches!(rx.recv().await.unwrap(), ReplEvent::SiteDemoted { .. }));
    assert_eq!(a.service.site_access(), SiteAccess::ReadWrite);
    a.service.create(InodeId::ROOT_INODE, "still-writable", 0, 0, 0o644).await.unwrap();

    // two successes do not promote a degraded site
    for _ in 0..2 {
        assert!(failover.record_health(1, true).await.is_empty());
    }
    assert_eq!(failover.site_mode(1).await, Some(SiteMode::DegradedAcceptWrites));

    for _ in 0..3 {
        failover.record_health(1, false).await;
    }
    assert_eq!(failover.site_mode(1).await, Some(SiteMode::Offline));
    assert!(matches!(
        a.service.getattr(InodeId::ROOT_INODE),
        Err(MetaError::SiteOffline)
    ));

    // recovery_threshold successes per level
    assert!(failover.record_health(1, true).await.is_empty());
    failover.record_health(1, true).await;
    assert_eq!(failover.site_mode(1).await, Some(SiteMode::StandbyReadOnly));
    assert!(a.service.getattr(InodeId::ROOT_INODE).is_ok());
    assert!(matches!(
        a.service.create(InodeId::ROOT_INODE, "g", 0, 0, 0o644).await,
        Err(MetaError::ReadOnly)
    ));

    failover.record_health(1, true).await;
    let events = failover.record_health(1, true).await;
    assert!(events.contains(&ReplEvent::SiteRecovered { site_id: 1 }));
    a.service.create(InodeId::ROOT_INODE, "g", 0, 0, 0o644).await.unwrap();

    a.shutdown().await;
}

#[tokio::test]
async fn test_site_tasks_replicate_both_ways() {
    let (a, b) = two_sites(EngineConfig::default()).await;
    connect(&a, &b).await;

    let x = a.service.create(InodeId::ROOT_INODE, "x", 0, 0, 0o644).await.unwrap();
    assert!(eventually(|| b.service.lookup(InodeId::ROOT_INODE, "x").is_ok()).await);
    assert_eq!(b.service.getattr(x.ino).unwrap().vector_clock, x.vector_clock);

    let y = b.service.create(InodeId::ROOT_INODE, "y", 0, 0, 0o644).await.unwrap();
    assert!(eventually(|| a.service.lookup(InodeId::ROOT_INODE, "y").is_ok()).await);
    assert_eq!(a.service.getattr(y.ino).unwrap().vector_clock, y.vector_clock);

    // applied remote entries are not echoed back
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.engine.site_stats(2).await.unwrap().entries_applied, 1);
    assert_eq!(b.engine.site_stats(1).await.unwrap().entries_applied, 2);
    assert!(a.engine.conflict_alerts().await.is_empty());
    assert!(b.engine.conflict_alerts().await.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_full_outbox_sheds_oldest_batch() {
    let config = EngineConfig {
        outbox_capacity: 2,
        max_batch_entries: 1,
        retry_backoff: Duration::from_millis(10),
        throttle: ThrottleConfig::default(),
        ..EngineConfig::default()
    };
    let (a, b) = two_sites(config).await;
    // B needs the root before later creates can land
    ship(&a, &b, 0, 1).await.1.unwrap();
    let mut rx = a.events.subscribe();
    let (link, _) = connect(&a, &b).await;
    link.set_connected(false);

    for i in 0..6 {
        a.service
            .create(InodeId::ROOT_INODE, &format!("f{}", i), 0, 0, 0o644)
            .await
            .unwrap();
    }
    let shed = eventually(|| {
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ReplEvent::BatchesShed { site_id: 2, .. }) {
                return true;
            }
        }
        false
    })
    .await;
    assert!(shed);

    link.set_connected(true);
    assert!(eventually(|| b.service.lookup(InodeId::ROOT_INODE, "f5").is_ok()).await);
    assert!(
        !a.engine
            .audit_query(&AuditFilter::kind(AuditEventKind::BatchShed))
            .await
            .is_empty()
    );
    assert!(a.engine.site_stats(2).await.unwrap().batches_shed >= 1);

    a.shutdown().await;
    b.shutdown().await;
}
