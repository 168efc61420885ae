// ABOUTME: Tests for the discovery service.
// ABOUTME: Runs full discoveries over the in-memory store and simulated automation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use super::{DiscoveryRequest, DiscoveryService, Priority};
use crate::automation::{AutomationKind, RawPost, ScriptedOutcome, Simulation};
use crate::cipher::PlaintextCipher;
use crate::clock::ManualClock;
use crate::compliance::{AlertType, Block};
use crate::config::{GovernorConfig, PoolConfig, TrawlConfig};
use crate::error::{DiscoveryError, SessionError, StoreError, TrawlError};
use crate::hook::HookRegistry;
use crate::session::SessionStatus;
use crate::store::{Account, Agent, DirectoryStore, LeadStore, MemoryStore};

struct Harness {
    service: DiscoveryService,
    store: Arc<MemoryStore>,
    sim: Simulation,
    hooks: Arc<HookRegistry>,
    session_id: String,
}

fn config() -> TrawlConfig {
    let mut config = TrawlConfig::default();
    config.governor = GovernorConfig::default()
        .burst(100, Duration::from_secs(10))
        .per_minute(100)
        .base_delay(Duration::ZERO);
    config.pool = PoolConfig::default()
        .size(2)
        .retries(3, Duration::from_millis(1));
    config.discovery.session_wait = Duration::from_millis(100);
    config
}

async fn harness(config: TrawlConfig) -> Harness {
    let store = MemoryStore::shared();
    store
        .save_account(&Account::new("acct-1", "Roofing Co"))
        .await
        .unwrap();
    store
        .save_agent(
            &Agent::new("agent-1", "acct-1", "roof leads")
                .keywords(vec!["roof repair".to_string()]),
        )
        .await
        .unwrap();

    let sim = Simulation::new();
    let hooks = HookRegistry::shared();
    let service = DiscoveryService::start(
        config,
        store.clone(),
        &AutomationKind::Simulated(sim.clone()),
        Arc::new(PlaintextCipher),
        ManualClock::shared(),
        Some(hooks.clone()),
    )
    .await
    .unwrap();

    let session = service
        .sessions()
        .create("acct-1", b"cookie=abc", "test-agent")
        .await
        .unwrap();

    Harness {
        service,
        store,
        sim,
        hooks,
        session_id: session.id,
    }
}

fn request() -> DiscoveryRequest {
    DiscoveryRequest::new("agent-1").priority(Priority::High)
}

#[tokio::test]
async fn test_run_discovery_saves_scored_leads() {
    let h = harness(config()).await;

    let report = h.service.run_discovery(request()).await.unwrap();

    assert_eq!(report.total_found, 5);
    assert_eq!(report.saved, 5);
    assert_eq!(report.created, 5);
    assert_eq!(report.duplicates_skipped, 0);
    assert_eq!(report.errors, 0);
    assert_eq!(report.hot + report.medium + report.cold, 5);
    assert_eq!(report.session_id.as_deref(), Some(h.session_id.as_str()));
    assert!(!report.from_cache);

    assert_eq!(h.store.list_leads("agent-1").await.unwrap().len(), 5);
    assert_eq!(h.sim.searches(), 1);
    assert_eq!(h.service.governor().in_flight(), 0);

    let session = h.service.sessions().get(&h.session_id).await.unwrap();
    assert_eq!(session.success_count, 1);
}

#[tokio::test]
async fn test_repeat_run_is_served_from_cache() {
    let h = harness(config()).await;
    h.service.run_discovery(request()).await.unwrap();

    let again = h.service.run_discovery(request()).await.unwrap();
    assert!(again.from_cache);
    assert_eq!(again.session_id, None);
    assert_eq!(again.total_found, 5);
    assert_eq!(again.saved, 0);
    assert_eq!(again.duplicates_skipped, 5);

    assert_eq!(h.sim.searches(), 1);
    assert_eq!(h.store.list_leads("agent-1").await.unwrap().len(), 5);
    assert_eq!(h.service.governor().in_flight(), 0);
    assert_eq!(h.service.dedup().cache_stats().hits, 1);
}

#[tokio::test]
async fn test_request_keywords_override_agent_keywords() {
    let h = harness(config()).await;
    let report = h
        .service
        .run_discovery(request().keywords(["gutters"]))
        .await
        .unwrap();
    assert_eq!(report.created, 5);

    let leads = h.store.list_leads("agent-1").await.unwrap();
    assert!(
        leads
            .iter()
            .all(|l| l.external_id.as_deref().unwrap_or("").starts_with("sim-gutters-"))
    );
}

#[tokio::test]
async fn test_unknown_or_inactive_agent_fails() {
    let h = harness(config()).await;

    let err = h
        .service
        .run_discovery(DiscoveryRequest::new("nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::AgentNotFound(id) if id == "nobody"));

    let mut paused = Agent::new("agent-2", "acct-1", "paused agent");
    paused.active = false;
    h.store.save_agent(&paused).await.unwrap();
    assert!(matches!(
        h.service.run_discovery(DiscoveryRequest::new("agent-2")).await,
        Err(DiscoveryError::AgentNotFound(_))
    ));

    h.store
        .save_agent(&Agent::new("agent-3", "acct-missing", "orphan"))
        .await
        .unwrap();
    assert!(matches!(
        h.service.run_discovery(DiscoveryRequest::new("agent-3")).await,
        Err(DiscoveryError::AccountNotFound(id)) if id == "acct-missing"
    ));
    assert_eq!(h.sim.searches(), 0);
}

#[tokio::test]
async fn test_rate_limited_run_is_not_admitted() {
    let mut config = config();
    config.governor = config.governor.burst(1, Duration::from_secs(10));
    let h = harness(config).await;

    h.service.run_discovery(request()).await.unwrap();
    let err = h
        .service
        .run_discovery(request().keywords(["something else"]))
        .await
        .unwrap_err();

    match &err {
        DiscoveryError::NotAdmitted {
            reason,
            retry_after_ms,
        } => {
            assert_eq!(reason, "burst");
            assert_eq!(*retry_after_ms, 10_000);
        }
        other => panic!("Expected NotAdmitted, got {:?}", other),
    }
    assert!(err.is_retryable());
    assert_eq!(h.sim.searches(), 1);
}

#[tokio::test]
async fn test_no_session_available_releases_admission() {
    let h = harness(config()).await;
    h.service.sessions().expire(&h.session_id, "manual").await.unwrap();

    let err = h.service.run_discovery(request()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::NoSessionAvailable { .. }));
    assert!(err.is_retryable());
    assert_eq!(h.service.governor().in_flight(), 0);
    assert_eq!(h.sim.searches(), 0);
}

#[tokio::test]
async fn test_blocking_response_blacklists_session() {
    let h = harness(config()).await;
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let sink = alerts.clone();
    h.hooks
        .on_alert(move |alert| sink.lock().push(alert.alert_type))
        .await;

    h.sim
        .push_outcome(ScriptedOutcome::Blocked("Please solve the CAPTCHA".into()));
    // no other session to fall back on
    let err = h.service.run_discovery(request()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::NoSessionAvailable { .. }));
    assert_eq!(h.sim.searches(), 1);

    let session = h.service.sessions().get(&h.session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Blacklisted);
    assert_eq!(session.health_score(), 0.0);
    assert_eq!(
        h.service.governor().block(&h.session_id),
        Some(Block::Blacklisted)
    );
    assert_eq!(alerts.lock().as_slice(), &[AlertType::BlockingDetected]);
    assert_eq!(h.service.governor().in_flight(), 0);
}

#[tokio::test]
async fn test_rejected_session_is_expired() {
    let h = harness(config()).await;
    let retired = Arc::new(Mutex::new(Vec::new()));
    let sink = retired.clone();
    h.hooks
        .on_session_retired(move |id, reason| sink.lock().push((id.to_string(), reason.to_string())))
        .await;

    h.sim
        .push_outcome(ScriptedOutcome::SessionInvalid("logged out".into()));
    assert!(matches!(
        h.service.run_discovery(request()).await,
        Err(DiscoveryError::NoSessionAvailable { .. })
    ));

    let session = h.service.sessions().get(&h.session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Expired);
    assert_eq!(
        retired.lock().as_slice(),
        &[(h.session_id.clone(), "logged out".to_string())]
    );

    // the only session is gone, so the next run cannot start
    assert!(matches!(
        h.service.run_discovery(request()).await,
        Err(DiscoveryError::NoSessionAvailable { .. })
    ));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = harness(config()).await;
    h.sim
        .push_outcome(ScriptedOutcome::Transient("page crashed".into()));

    let report = h.service.run_discovery(request()).await.unwrap();
    assert_eq!(report.saved, 5);
    assert_eq!(h.sim.searches(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_are_reported_not_raised() {
    let h = harness(config()).await;
    for _ in 0..3 {
        h.sim
            .push_outcome(ScriptedOutcome::Transient("page crashed".into()));
    }

    let report = h.service.run_discovery(request()).await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.saved, 0);
    assert!(report.search_error.as_deref().unwrap().contains("page crashed"));
    assert_eq!(report.session_id.as_deref(), Some(h.session_id.as_str()));
    assert_eq!(h.sim.searches(), 3);
    assert_eq!(h.service.governor().in_flight(), 0);

    let session = h.service.sessions().get(&h.session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.failure_count, 1);
    assert_eq!(h.service.dedup().cache_stats().entries, 0);
}

#[tokio::test]
async fn test_rejected_session_fails_over_to_another() {
    let h = harness(config()).await;
    let second = h
        .service
        .sessions()
        .create("acct-1", b"cookie=def", "test-agent")
        .await
        .unwrap();

    h.sim
        .push_outcome(ScriptedOutcome::SessionInvalid("logged out".into()));
    let report = h.service.run_discovery(request()).await.unwrap();
    assert_eq!(report.created, 5);
    assert_eq!(report.errors, 0);
    assert_eq!(h.sim.searches(), 2);

    let first = h.service.sessions().get(&h.session_id).await.unwrap();
    let second = h.service.sessions().get(&second.id).await.unwrap();
    let (rejected, used) = if first.status == SessionStatus::Expired {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(rejected.status, SessionStatus::Expired);
    assert_eq!(used.status, SessionStatus::Active);
    assert_eq!(used.success_count, 1);
    assert_eq!(report.session_id.as_deref(), Some(used.id.as_str()));
    assert_eq!(h.service.governor().in_flight(), 0);
}

#[tokio::test]
async fn test_blocked_session_fails_over_without_retrying_it() {
    let h = harness(config()).await;
    let second = h
        .service
        .sessions()
        .create("acct-1", b"cookie=def", "test-agent")
        .await
        .unwrap();

    h.sim
        .push_outcome(ScriptedOutcome::Blocked("Please solve the CAPTCHA".into()));
    h.sim
        .push_outcome(ScriptedOutcome::Blocked("Please solve the CAPTCHA".into()));
    let err = h.service.run_discovery(request()).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::NoSessionAvailable { .. }));

    // each session was tried once, then the run ran out of sessions
    assert_eq!(h.sim.searches(), 2);
    for id in [&h.session_id, &second.id] {
        let session = h.service.sessions().get(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Blacklisted);
    }
    assert_eq!(h.service.governor().in_flight(), 0);
}

#[tokio::test]
async fn test_cancelled_run_releases_everything() {
    let h = harness(config()).await;
    h.sim.push_outcome(ScriptedOutcome::Hang);

    let err = h
        .service
        .run_discovery_with_cancel(request(), tokio::time::sleep(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Cancelled));
    assert_eq!(h.service.governor().in_flight(), 0);

    // the pool recovers the abandoned slot
    let report = h.service.run_discovery(request()).await.unwrap();
    assert_eq!(report.saved, 5);
}

#[tokio::test]
async fn test_batch_duplicates_persist_once() {
    let h = harness(config()).await;
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    h.sim.set_posts(vec![
        RawPost::new("jane", "Our roof needs repair after the storm").posted_at(at),
        RawPost::new("jane", "Our roof needs repair after the storm")
            .posted_at(at + chrono::Duration::seconds(1)),
    ]);

    let report = h.service.run_discovery(request()).await.unwrap();
    assert_eq!(report.total_found, 2);
    assert_eq!(report.saved, 1);
    assert_eq!(report.duplicates_skipped, 1);
    assert_eq!(h.store.list_leads("agent-1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_hooks_fire() {
    let h = harness(config()).await;
    let completed = Arc::new(Mutex::new(Vec::new()));
    let sink = completed.clone();
    h.hooks
        .on_run_completed(move |agent_id, report, error| {
            sink.lock()
                .push((agent_id.to_string(), report.map(|r| r.saved), error.is_some()));
        })
        .await;

    h.service.run_discovery(request()).await.unwrap();
    let _ = h.service.run_discovery(DiscoveryRequest::new("nobody")).await;

    assert_eq!(
        completed.lock().as_slice(),
        &[
            ("agent-1".to_string(), Some(5), false),
            ("nobody".to_string(), None, true),
        ]
    );
}

#[tokio::test]
async fn test_failed_start_leaves_no_running_instances() {
    let store = MemoryStore::shared();
    store.set_unavailable(true);
    let sim = Simulation::new();

    let result = DiscoveryService::start(
        config(),
        store,
        &AutomationKind::Simulated(sim.clone()),
        Arc::new(PlaintextCipher),
        ManualClock::shared(),
        None,
    )
    .await;

    assert!(matches!(
        result,
        Err(TrawlError::Session(SessionError::Store(StoreError::Unavailable(_))))
    ));
    assert_eq!(sim.shutdowns(), sim.created());
}

#[tokio::test]
async fn test_concurrent_runs_share_the_pool() {
    let h = harness(config()).await;
    let service = Arc::new(h.service);

    let runs: Vec<_> = ["roofing", "gutters", "siding", "windows"]
        .into_iter()
        .map(|kw| {
            let service = service.clone();
            tokio::spawn(async move { service.run_discovery(request().keywords([kw])).await })
        })
        .collect();

    for run in runs {
        assert_eq!(run.await.unwrap().unwrap().created, 5);
    }
    assert_eq!(h.store.list_leads("agent-1").await.unwrap().len(), 20);
    assert_eq!(service.governor().in_flight(), 0);
    assert_eq!(service.pool().stats().completed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_priority_scales_pacing_delay() {
    let mut config = config();
    config.governor = config.governor.base_delay(Duration::from_millis(1_000));
    let h = harness(config).await;

    let started = tokio::time::Instant::now();
    h.service.run_discovery(request()).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);

    let started = tokio::time::Instant::now();
    h.service
        .run_discovery(
            DiscoveryRequest::new("agent-1")
                .keywords(["slow lane"])
                .priority(Priority::Low),
        )
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1_000));
}
