// ABOUTME: Tests for the session lifecycle manager.
// ABOUTME: Covers creation, acquisition ordering, health scoring and refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Session, SessionLifecycleManager, SessionStatus};
use crate::automation::{
    AutomationSession, RefreshedSession, SessionProbe, SessionValidation, Simulation,
};
use crate::cipher::{Cipher, PlaintextCipher};
use crate::clock::{Clock, ManualClock};
use crate::config::SessionConfig;
use crate::error::{AutomationError, CipherError, SessionError};
use crate::hook::HookRegistry;
use crate::store::{Account, DirectoryStore, MemoryStore, SessionStore};

struct Fixture {
    manager: Arc<SessionLifecycleManager>,
    store: Arc<MemoryStore>,
    sim: Simulation,
    clock: Arc<ManualClock>,
}

async fn fixture_with(config: SessionConfig, cipher: Arc<dyn Cipher>) -> Fixture {
    let store = MemoryStore::shared();
    store
        .save_account(&Account::new("acct-1", "Acme Roofing"))
        .await
        .unwrap();

    let sim = Simulation::new();
    let clock = ManualClock::shared();
    let manager = SessionLifecycleManager::new(
        config,
        store.clone(),
        store.clone(),
        cipher,
        Arc::new(sim.clone()),
        clock.clone(),
    );

    Fixture {
        manager: Arc::new(manager),
        store,
        sim,
        clock,
    }
}

async fn fixture() -> Fixture {
    fixture_with(
        SessionConfig::default().refresh_retries(3, Duration::from_millis(1)),
        Arc::new(PlaintextCipher),
    )
    .await
}

struct BrokenCipher;

#[async_trait]
impl Cipher for BrokenCipher {
    async fn encrypt(&self, _plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Encrypt("key service offline".into()))
    }

    async fn decrypt(&self, _blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Decrypt("key service offline".into()))
    }
}

#[tokio::test]
async fn test_create_fresh_session_is_active_with_full_health() {
    let f = fixture().await;
    let session = f
        .manager
        .create("acct-1", b"cookie=abc", "Mozilla/5.0")
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.health_score(), 1.0);
    assert_eq!(
        (session.expires_at - f.clock.now()).num_hours(),
        24,
        "default TTL applies when the probe reports no expiry"
    );

    let persisted = f.store.load_session(&session.id).await.unwrap().unwrap();
    assert_eq!(persisted, session);
}

#[tokio::test]
async fn test_create_unknown_account_fails() {
    let f = fixture().await;
    let err = f
        .manager
        .create("acct-missing", b"cookie=abc", "ua")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AccountNotFound(id) if id == "acct-missing"));
}

#[tokio::test]
async fn test_failed_validation_persists_nothing() {
    let f = fixture().await;
    f.sim.fail_validations(1);

    let err = f
        .manager
        .create("acct-1", b"cookie=abc", "ua")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ValidationFailed(_)));
    assert!(f.store.list_sessions().await.unwrap().is_empty());
    assert!(f.manager.list(None).await.is_empty());
}

#[tokio::test]
async fn test_cipher_failure_persists_nothing() {
    let f = fixture_with(SessionConfig::default(), Arc::new(BrokenCipher)).await;

    let err = f
        .manager
        .create("acct-1", b"cookie=abc", "ua")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Cipher(_)));
    assert!(f.store.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_acquire_prefers_least_recently_used_on_equal_health() {
    let f = fixture().await;
    let first = f.manager.create("acct-1", b"a", "ua").await.unwrap();
    f.clock.advance(Duration::from_secs(1));
    let second = f.manager.create("acct-1", b"b", "ua").await.unwrap();
    f.clock.advance(Duration::from_secs(1));

    let got = f.manager.acquire(Some("acct-1")).await.unwrap().unwrap();
    assert_eq!(got.id, first.id);
    assert_eq!(got.last_activity_at, f.clock.now());

    let got = f.manager.acquire(Some("acct-1")).await.unwrap().unwrap();
    assert_eq!(got.id, second.id);
}

#[tokio::test]
async fn test_acquire_prefers_highest_health() {
    let f = fixture().await;
    let weaker = f.manager.create("acct-1", b"a", "ua").await.unwrap();
    let stronger = f.manager.create("acct-1", b"b", "ua").await.unwrap();
    f.manager
        .report_outcome(&weaker.id, false, 100)
        .await
        .unwrap();

    let got = f.manager.acquire(None).await.unwrap().unwrap();
    assert_eq!(got.id, stronger.id);
}

#[tokio::test]
async fn test_acquire_never_returns_unusable_sessions() {
    let f = fixture().await;
    let blacklisted = f.manager.create("acct-1", b"a", "ua").await.unwrap();
    let unhealthy = f.manager.create("acct-1", b"b", "ua").await.unwrap();

    f.manager
        .blacklist(&blacklisted.id, "captcha wall")
        .await
        .unwrap();
    for _ in 0..4 {
        f.manager
            .report_outcome(&unhealthy.id, false, 100)
            .await
            .unwrap();
    }
    // 1.0 - 4 * 0.1 = 0.6, still acquirable
    assert!(f.manager.acquire(None).await.unwrap().is_some());

    f.manager
        .report_outcome(&unhealthy.id, true, 100)
        .await
        .unwrap();
    f.manager
        .report_outcome(&unhealthy.id, false, 100)
        .await
        .unwrap();
    f.manager
        .report_outcome(&unhealthy.id, false, 100)
        .await
        .unwrap();

    let snapshot = f.manager.get(&unhealthy.id).await.unwrap();
    assert!(snapshot.health_score() < 0.5);
    assert!(f.manager.acquire(None).await.unwrap().is_none());
    assert!(f.manager.acquire(Some("acct-other")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_health_stays_within_bounds() {
    let f = fixture_with(
        SessionConfig::default().max_consecutive_failures(0),
        Arc::new(PlaintextCipher),
    )
    .await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();

    for i in 0..40 {
        let success = i % 7 == 0;
        f.manager
            .report_outcome(&session.id, success, 50)
            .await
            .unwrap();
        let health = f.manager.get(&session.id).await.unwrap().health_score();
        assert!((0.0..=1.0).contains(&health), "health {} out of range", health);
    }
    for _ in 0..40 {
        f.manager
            .report_outcome(&session.id, true, 50)
            .await
            .unwrap();
        let health = f.manager.get(&session.id).await.unwrap().health_score();
        assert!((0.0..=1.0).contains(&health), "health {} out of range", health);
    }
}

#[tokio::test]
async fn test_concurrent_outcomes_are_not_lost() {
    let f = fixture_with(
        SessionConfig::default().max_consecutive_failures(0),
        Arc::new(PlaintextCipher),
    )
    .await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..50 {
        let manager = f.manager.clone();
        let id = session.id.clone();
        tasks.push(tokio::spawn(async move {
            manager.report_outcome(&id, i % 2 == 0, 10).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let after = f.manager.get(&session.id).await.unwrap();
    assert_eq!(after.success_count + after.failure_count, 50);
    assert_eq!(after.failure_count, 25);
}

#[tokio::test]
async fn test_compute_health_applies_failure_rate_penalty() {
    let f = fixture().await;
    let now = f.clock.now();
    let mut session = Session::new(
        "s-scenario",
        "acct-1",
        b"a".to_vec(),
        "ua",
        now,
        now + chrono::Duration::hours(24),
    );
    session.status = SessionStatus::Active;
    session.failure_count = 5;
    f.store.save_session(&session).await.unwrap();
    assert_eq!(f.manager.hydrate().await.unwrap(), 1);

    let report = f.manager.compute_health("s-scenario").await.unwrap();
    assert!((report.score - 0.5).abs() < 1e-9, "score was {}", report.score);
    assert!(report.is_healthy);
    assert!(
        report.issues.iter().any(|i| i.contains("high failure rate")),
        "issues: {:?}",
        report.issues
    );
}

#[tokio::test]
async fn test_compute_health_penalizes_staleness_and_short_ttl() {
    let f = fixture().await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();

    // 23.5h later: idle for longer than the check interval, under 1h of TTL left
    f.clock.advance(Duration::from_secs(23 * 3600 + 1800));
    let report = f.manager.compute_health(&session.id).await.unwrap();

    assert!((report.score - 0.72).abs() < 1e-9, "score was {}", report.score);
    assert_eq!(report.issues.len(), 2);
    assert!(report.is_healthy);
}

#[tokio::test]
async fn test_consecutive_failures_fail_the_session() {
    let f = fixture().await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();

    for _ in 0..5 {
        f.manager
            .report_outcome(&session.id, false, 100)
            .await
            .unwrap();
    }

    let after = f.manager.get(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Failed);
    assert_eq!(after.consecutive_failures, 5);
}

#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let f = fixture().await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();

    for _ in 0..4 {
        f.manager
            .report_outcome(&session.id, false, 100)
            .await
            .unwrap();
    }
    f.manager
        .report_outcome(&session.id, true, 100)
        .await
        .unwrap();
    f.manager
        .report_outcome(&session.id, false, 100)
        .await
        .unwrap();

    let after = f.manager.get(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Active);
    assert_eq!(after.consecutive_failures, 1);
}

#[tokio::test]
async fn test_blacklist_is_terminal() {
    let f = fixture().await;
    let hooks = HookRegistry::shared();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    hooks
        .on_session_retired(move |id, reason| sink.lock().push((id.to_string(), reason.to_string())))
        .await;

    let store = f.store.clone();
    let manager = SessionLifecycleManager::new(
        SessionConfig::default(),
        store.clone(),
        store.clone(),
        Arc::new(PlaintextCipher),
        Arc::new(f.sim.clone()),
        f.clock.clone(),
    )
    .with_hooks(hooks);

    let session = manager.create("acct-1", b"a", "ua").await.unwrap();
    manager.blacklist(&session.id, "captcha wall").await.unwrap();
    manager.blacklist(&session.id, "again").await.unwrap();
    manager.report_outcome(&session.id, true, 10).await.unwrap();

    let after = manager.get(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Blacklisted);
    assert_eq!(after.health_score(), 0.0);
    assert_eq!(after.success_count, 0);
    assert_eq!(seen.lock().len(), 1);

    let err = manager.credentials(&session.id).await.unwrap_err();
    assert!(matches!(err, SessionError::Unusable { .. }));
}

#[tokio::test]
async fn test_refresh_sweep_refreshes_expiring_sessions() {
    let f = fixture().await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();
    for _ in 0..3 {
        f.manager
            .report_outcome(&session.id, false, 100)
            .await
            .unwrap();
    }

    f.clock.advance(Duration::from_secs(23 * 3600 + 1800));
    let report = f.manager.refresh_sweep().await;

    assert_eq!(report.marked_expiring, vec![session.id.clone()]);
    assert_eq!(report.refreshed, vec![session.id.clone()]);
    assert!(report.expired.is_empty());

    let after = f.manager.get(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Active);
    assert_eq!(after.health_score(), 0.9);
    assert_eq!((after.expires_at - f.clock.now()).num_hours(), 24);
    assert_eq!(f.sim.refreshes(), 1);
}

#[tokio::test]
async fn test_refresh_exhaustion_expires_session() {
    let f = fixture().await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();
    f.sim.fail_refreshes(3);

    f.clock.advance(Duration::from_secs(23 * 3600 + 1800));
    let report = f.manager.refresh_sweep().await;

    assert_eq!(report.expired, vec![session.id.clone()]);
    assert_eq!(f.sim.refreshes(), 3);

    let after = f.manager.get(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Expired);
    assert!(
        after
            .status_reason
            .as_deref()
            .is_some_and(|r| r.contains("3 attempts"))
    );

    // terminal: the next sweep leaves it alone
    let report = f.manager.refresh_sweep().await;
    assert!(report.expired.is_empty());
    assert_eq!(f.sim.refreshes(), 3);
}

#[tokio::test]
async fn test_sweep_expires_sessions_past_their_lifetime() {
    let f = fixture().await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();

    f.clock.advance(Duration::from_secs(25 * 3600));
    let report = f.manager.refresh_sweep().await;

    assert_eq!(report.expired, vec![session.id.clone()]);
    assert_eq!(f.sim.refreshes(), 0);
    assert_eq!(
        f.manager.get(&session.id).await.unwrap().status,
        SessionStatus::Expired
    );
}

#[tokio::test]
async fn test_acquire_wait_wakes_when_session_created() {
    let f = fixture().await;

    let manager = f.manager.clone();
    let waiter = tokio::spawn(async move {
        manager
            .acquire_wait(Some("acct-1"), Duration::from_secs(5))
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let created = f.manager.create("acct-1", b"a", "ua").await.unwrap();

    let got = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(got.id, created.id);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_wait_times_out_with_none() {
    let f = fixture().await;
    let got = f
        .manager
        .acquire_wait(None, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(got.is_none());
}

#[tokio::test]
async fn test_stats_count_by_status() {
    let f = fixture().await;
    let a = f.manager.create("acct-1", b"a", "ua").await.unwrap();
    f.manager.create("acct-1", b"b", "ua").await.unwrap();
    f.manager.blacklist(&a.id, "blocked").await.unwrap();

    let stats = f.manager.stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.blacklisted, 1);
    assert_eq!(stats.average_health, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_loop_runs_and_shuts_down() {
    let f = fixture().await;
    let session = f.manager.create("acct-1", b"a", "ua").await.unwrap();
    f.clock.advance(Duration::from_secs(25 * 3600));

    let handle = f.manager.spawn_refresh_loop();
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.shutdown().await;

    assert_eq!(
        f.manager.get(&session.id).await.unwrap().status,
        SessionStatus::Expired
    );
}

/// Probe whose calls never complete while stalled.
#[derive(Default)]
struct StallingProbe {
    stall_validate: AtomicBool,
    stall_refresh: AtomicBool,
    refreshes: AtomicUsize,
}

#[async_trait]
impl SessionProbe for StallingProbe {
    async fn validate(
        &self,
        _credentials: &[u8],
        _user_agent: &str,
    ) -> Result<SessionValidation, AutomationError> {
        if self.stall_validate.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(SessionValidation::default())
    }

    async fn refresh(
        &self,
        _session: &AutomationSession,
    ) -> Result<RefreshedSession, AutomationError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.stall_refresh.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(RefreshedSession::default())
    }
}

async fn stalling_manager(
    probe: Arc<StallingProbe>,
) -> (Arc<SessionLifecycleManager>, Arc<ManualClock>) {
    let store = MemoryStore::shared();
    store
        .save_account(&Account::new("acct-1", "Acme Roofing"))
        .await
        .unwrap();
    let clock = ManualClock::shared();
    let manager = SessionLifecycleManager::new(
        SessionConfig::default()
            .refresh_retries(2, Duration::from_millis(1))
            .probe_timeout(Duration::from_secs(5)),
        store.clone(),
        store,
        Arc::new(PlaintextCipher),
        probe,
        clock.clone(),
    );
    (Arc::new(manager), clock)
}

#[tokio::test(start_paused = true)]
async fn test_stalled_validation_times_out() {
    let probe = Arc::new(StallingProbe::default());
    probe.stall_validate.store(true, Ordering::SeqCst);
    let (manager, _clock) = stalling_manager(probe).await;

    let err = manager.create("acct-1", b"a", "ua").await.unwrap_err();
    assert!(matches!(err, SessionError::ValidationFailed(msg) if msg.contains("timed out")));
    assert!(manager.list(None).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_refresh_counts_as_failed_attempt() {
    let probe = Arc::new(StallingProbe::default());
    let (manager, clock) = stalling_manager(probe.clone()).await;
    let session = manager.create("acct-1", b"a", "ua").await.unwrap();

    probe.stall_refresh.store(true, Ordering::SeqCst);
    clock.advance(Duration::from_secs(23 * 3600 + 1800));
    let report = manager.refresh_sweep().await;

    assert_eq!(report.expired, vec![session.id.clone()]);
    assert_eq!(probe.refreshes.load(Ordering::SeqCst), 2);
    let after = manager.get(&session.id).await.unwrap();
    assert_eq!(after.status, SessionStatus::Expired);
    assert!(
        after
            .status_reason
            .as_deref()
            .is_some_and(|r| r.contains("timed out"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_refresh_is_resumed_by_next_sweep() {
    let probe = Arc::new(StallingProbe::default());
    let (manager, clock) = stalling_manager(probe.clone()).await;
    let session = manager.create("acct-1", b"a", "ua").await.unwrap();

    probe.stall_refresh.store(true, Ordering::SeqCst);
    clock.advance(Duration::from_secs(23 * 3600 + 1800));
    let dropped = tokio::time::timeout(Duration::from_millis(10), manager.refresh_sweep()).await;
    assert!(dropped.is_err());
    assert_eq!(
        manager.get(&session.id).await.unwrap().status,
        SessionStatus::Refreshing
    );

    probe.stall_refresh.store(false, Ordering::SeqCst);
    let report = manager.refresh_sweep().await;
    assert!(report.marked_expiring.is_empty());
    assert_eq!(report.refreshed, vec![session.id.clone()]);
    assert_eq!(
        manager.get(&session.id).await.unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test(start_paused = true)]
async fn test_refresh_loop_shutdown_abandons_stalled_sweep() {
    let probe = Arc::new(StallingProbe::default());
    let (manager, clock) = stalling_manager(probe.clone()).await;
    let session = manager.create("acct-1", b"a", "ua").await.unwrap();

    probe.stall_refresh.store(true, Ordering::SeqCst);
    clock.advance(Duration::from_secs(23 * 3600 + 1800));
    let handle = manager.spawn_refresh_loop();
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.shutdown().await;

    // the sweep was dropped before its attempts ran out
    assert_eq!(probe.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.get(&session.id).await.unwrap().status,
        SessionStatus::Refreshing
    );
}
