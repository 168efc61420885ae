// ABOUTME: DiscoveryService - the caller-facing entry point composing the core.
// ABOUTME: Admit, acquire, dispatch, deduplicate, score and persist one run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{DiscoveryReport, DiscoveryRequest};
use crate::automation::AutomationKind;
use crate::cipher::Cipher;
use crate::clock::Clock;
use crate::compliance::{ComplianceAlert, ComplianceGovernor, CompletionMeta, EnforcementAction};
use crate::config::{DiscoveryConfig, TrawlConfig};
use crate::dedup::{ResultDeduplicator, search_fingerprint};
use crate::error::{AutomationError, DiscoveryError, PoolError, TrawlError};
use crate::hook::{HookEvent, HookRegistry, fire_opt};
use crate::pool::WorkerPool;
use crate::scoring::LeadCategory;
use crate::session::SessionLifecycleManager;
use crate::store::{DirectoryStore, LeadStore, SessionStore};

/// Runs discoveries against shared components.
///
/// Every component is constructor-injected; the service owns no global
/// state. Runs are independent and may execute concurrently.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    governor: Arc<ComplianceGovernor>,
    sessions: Arc<SessionLifecycleManager>,
    pool: Arc<WorkerPool>,
    dedup: Arc<ResultDeduplicator>,
    directory: Arc<dyn DirectoryStore>,
    hooks: Option<Arc<HookRegistry>>,
}

impl DiscoveryService {
    pub fn new(
        config: DiscoveryConfig,
        governor: Arc<ComplianceGovernor>,
        sessions: Arc<SessionLifecycleManager>,
        pool: Arc<WorkerPool>,
        dedup: Arc<ResultDeduplicator>,
        directory: Arc<dyn DirectoryStore>,
    ) -> Self {
        Self {
            config,
            governor,
            sessions,
            pool,
            dedup,
            directory,
            hooks: None,
        }
    }

    /// Fire run and alert events into this registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Build every component over one store, initialize the pool and load
    /// persisted sessions.
    pub async fn start<S>(
        config: TrawlConfig,
        store: Arc<S>,
        automation: &AutomationKind,
        cipher: Arc<dyn Cipher>,
        clock: Arc<dyn Clock>,
        hooks: Option<Arc<HookRegistry>>,
    ) -> Result<Self, TrawlError>
    where
        S: SessionStore + DirectoryStore + LeadStore + 'static,
    {
        let TrawlConfig {
            governor,
            sessions,
            pool,
            cache,
            dedup,
            discovery,
        } = config;
        let pool_size = pool.size;

        let governor = Arc::new(ComplianceGovernor::new(governor, clock.clone()));

        let mut manager = SessionLifecycleManager::new(
            sessions,
            store.clone(),
            store.clone(),
            cipher,
            automation.probe(),
            clock.clone(),
        );
        let mut workers = WorkerPool::new(pool, automation.factory());
        if let Some(hooks) = &hooks {
            manager = manager.with_hooks(hooks.clone());
            workers = workers.with_hooks(hooks.clone());
        }

        // no automation instance starts until the registry has loaded
        let hydrated = manager.hydrate().await?;
        workers.initialize(pool_size).await?;
        info!(pool_size, sessions = hydrated, "discovery service started");

        let dedup = Arc::new(ResultDeduplicator::new(dedup, cache, store.clone(), clock));
        let mut service = Self::new(
            discovery,
            governor,
            Arc::new(manager),
            Arc::new(workers),
            dedup,
            store,
        );
        service.hooks = hooks;
        Ok(service)
    }

    pub fn governor(&self) -> &Arc<ComplianceGovernor> {
        &self.governor
    }

    pub fn sessions(&self) -> &Arc<SessionLifecycleManager> {
        &self.sessions
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn dedup(&self) -> &Arc<ResultDeduplicator> {
        &self.dedup
    }

    /// Run one discovery.
    pub async fn run_discovery(
        &self,
        request: DiscoveryRequest,
    ) -> Result<DiscoveryReport, DiscoveryError> {
        self.run_discovery_with_cancel(request, std::future::pending())
            .await
    }

    /// Run one discovery, aborting when `cancel` completes.
    ///
    /// Fails outright for a missing agent or account, non-admission, no
    /// usable session or an unusable worker pool. A session that rejects the
    /// search is swapped for another within `session_wait`. Other search
    /// failures and partial persistence failures are counted in the report.
    pub async fn run_discovery_with_cancel<F>(
        &self,
        request: DiscoveryRequest,
        cancel: F,
    ) -> Result<DiscoveryReport, DiscoveryError>
    where
        F: std::future::Future<Output = ()>,
    {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        fire_opt(
            &self.hooks,
            HookEvent::RunStarted {
                run_id: run_id.clone(),
                agent_id: request.agent_id.clone(),
                keywords: request.keywords.clone(),
            },
        )
        .await;

        let result = self
            .run(&run_id, &request, cancel)
            .await
            .map(|mut report| {
                report.duration_ms = started.elapsed().as_millis() as u64;
                report
            });

        match &result {
            Ok(report) => info!(
                run_id = %run_id,
                agent_id = %request.agent_id,
                found = report.total_found,
                saved = report.saved,
                duplicates = report.duplicates_skipped,
                hot = report.hot,
                from_cache = report.from_cache,
                "discovery run completed"
            ),
            Err(e) => warn!(
                run_id = %run_id,
                agent_id = %request.agent_id,
                error = %e,
                "discovery run failed"
            ),
        }

        fire_opt(
            &self.hooks,
            HookEvent::RunCompleted {
                run_id,
                agent_id: request.agent_id.clone(),
                report: result.as_ref().ok().cloned(),
                error: result.as_ref().err().map(|e| e.to_string()),
            },
        )
        .await;

        result
    }

    /// Stop the worker pool. Sessions and stores are left as they are.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn run<F>(
        &self,
        run_id: &str,
        request: &DiscoveryRequest,
        cancel: F,
    ) -> Result<DiscoveryReport, DiscoveryError>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancel);

        let agent = self
            .directory
            .get_agent(&request.agent_id)
            .await?
            .filter(|a| a.active)
            .ok_or_else(|| DiscoveryError::AgentNotFound(request.agent_id.clone()))?;
        let account = self
            .directory
            .get_account(&agent.account_id)
            .await?
            .filter(|a| a.active)
            .ok_or_else(|| DiscoveryError::AccountNotFound(agent.account_id.clone()))?;

        let keywords = if request.keywords.is_empty() {
            agent.keywords.clone()
        } else {
            request.keywords.clone()
        };
        let mut options = agent.options.clone();
        options.max_results = options.max_results.min(self.config.max_results);

        let mut admission = self.admit(&agent.id)?;

        let mut report = DiscoveryReport {
            run_id: run_id.to_string(),
            agent_id: agent.id.clone(),
            ..Default::default()
        };

        let fingerprint = search_fingerprint(&keywords, &options);
        if let Some(entry) = self.dedup.get_cached(&fingerprint) {
            debug!(run_id, fingerprint = %fingerprint, "serving discovery from cache");
            admission.release();
            report.from_cache = true;
            report.total_found = entry.posts.len();
            self.persist_into(&mut report, &agent.id, &account.id, entry.posts, &keywords)
                .await;
            return Ok(report);
        }

        let delay = self.governor.recommended_delay(&agent.id) * request.priority.delay_factor();
        if !delay.is_zero() {
            debug!(run_id, delay_ms = delay.as_millis() as u64, priority = %request.priority, "pacing run");
            tokio::select! {
                biased;
                () = &mut cancel => return Err(DiscoveryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.session_wait;
        let mut tried = HashSet::new();

        let posts = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let acquired = tokio::select! {
                biased;
                () = &mut cancel => return Err(DiscoveryError::Cancelled),
                acquired = self.sessions.acquire_wait_excluding(Some(&account.id), &tried, remaining) => acquired?,
            };
            let session = acquired.ok_or(DiscoveryError::NoSessionAvailable {
                waited: self.config.session_wait,
            })?;
            tried.insert(session.id.clone());
            report.session_id = Some(session.id.clone());
            let credentials = self.sessions.credentials(&session.id).await?;

            let searched = Instant::now();
            let result = self
                .pool
                .dispatch_with_retry(&credentials, &keywords, &options, &mut cancel)
                .await;
            let elapsed_ms = searched.elapsed().as_millis() as u64;

            let e = match result {
                Ok(posts) => {
                    self.record_session_outcome(&session.id, true, elapsed_ms)
                        .await;
                    let alerts = admission.complete(
                        true,
                        elapsed_ms,
                        CompletionMeta::default()
                            .agent(agent.id.clone())
                            .session(session.id.clone()),
                    );
                    report.alerts += self.apply_alerts(alerts).await;
                    break posts;
                }
                Err(PoolError::Cancelled) => return Err(DiscoveryError::Cancelled),
                Err(e @ (PoolError::NoWorkerAvailable { .. } | PoolError::ShutDown)) => {
                    return Err(DiscoveryError::Unavailable(e));
                }
                Err(e) => e,
            };

            self.record_session_outcome(&session.id, false, elapsed_ms)
                .await;
            let mut meta = CompletionMeta::default()
                .agent(agent.id.clone())
                .session(session.id.clone());
            if let PoolError::Automation(AutomationError::Blocked(body)) = &e {
                meta = meta.body(body.clone());
            }
            if let PoolError::Automation(AutomationError::SessionInvalid(reason)) = &e {
                if let Err(err) = self.sessions.expire(&session.id, reason).await {
                    warn!(session_id = %session.id, error = %err, "failed to expire rejected session");
                }
            }
            let alerts = admission.complete(false, elapsed_ms, meta);
            report.alerts += self.apply_alerts(alerts).await;

            if !rejects_session(&e) {
                report.errors += 1;
                report.search_error = Some(e.to_string());
                return Ok(report);
            }

            // the next session is another outbound request
            warn!(run_id, session_id = %session.id, error = %e, "session rejected search, trying another");
            admission = self.admit(&agent.id)?;
        };

        report.total_found = posts.len();
        let batch = self.dedup.deduplicate(posts);
        self.dedup.put_cached(fingerprint, batch.posts.clone());
        report.duplicates_skipped += batch.duplicates();

        self.persist_into(&mut report, &agent.id, &account.id, batch.posts, &keywords)
            .await;
        Ok(report)
    }

    fn admit<'a>(&'a self, agent_id: &'a str) -> Result<Admission<'a>, DiscoveryError> {
        let decision = self.governor.admit(agent_id);
        if !decision.allowed {
            return Err(DiscoveryError::NotAdmitted {
                reason: decision
                    .reason
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_default(),
                retry_after_ms: decision.retry_after_ms.unwrap_or(0),
            });
        }
        Ok(Admission::new(&self.governor, agent_id))
    }

    async fn persist_into(
        &self,
        report: &mut DiscoveryReport,
        agent_id: &str,
        account_id: &str,
        posts: Vec<crate::automation::RawPost>,
        keywords: &[String],
    ) {
        let summary = self.dedup.persist(agent_id, account_id, posts, keywords).await;
        report.saved = summary.saved();
        report.created = summary.created;
        report.updated = summary.updated;
        report.duplicates_skipped += summary.skipped;
        report.errors += summary.errors;
        report.hot = summary.count(LeadCategory::Hot);
        report.medium = summary.count(LeadCategory::Medium);
        report.cold = summary.count(LeadCategory::Cold);
    }

    async fn record_session_outcome(&self, session_id: &str, success: bool, elapsed_ms: u64) {
        if let Err(e) = self
            .sessions
            .report_outcome(session_id, success, elapsed_ms)
            .await
        {
            warn!(session_id, error = %e, "failed to record session outcome");
        }
    }

    /// Carry alert enforcement over to sessions and notify hooks.
    async fn apply_alerts(&self, alerts: Vec<ComplianceAlert>) -> usize {
        let count = alerts.len();
        for alert in alerts {
            if alert.action == EnforcementAction::Blacklist {
                if let Some(session_id) = alert.session_id.as_deref() {
                    if let Err(e) = self.sessions.blacklist(session_id, &alert.message).await {
                        warn!(session_id, error = %e, "failed to blacklist session");
                    }
                }
            }
            fire_opt(&self.hooks, HookEvent::AlertRaised { alert }).await;
        }
        count
    }
}

/// Failures that say the session itself is unusable, so another may succeed.
fn rejects_session(e: &PoolError) -> bool {
    matches!(
        e,
        PoolError::Automation(AutomationError::SessionInvalid(_) | AutomationError::Blocked(_))
    )
}

/// A governor admission that must be settled exactly once.
///
/// Dropping it unsettled (early return, cancellation) releases the slot.
struct Admission<'a> {
    governor: &'a ComplianceGovernor,
    identifier: &'a str,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(governor: &'a ComplianceGovernor, identifier: &'a str) -> Self {
        Self {
            governor,
            identifier,
            settled: false,
        }
    }

    fn complete(
        mut self,
        success: bool,
        response_time_ms: u64,
        meta: CompletionMeta,
    ) -> Vec<ComplianceAlert> {
        self.settled = true;
        self.governor
            .report_completion(self.identifier, success, response_time_ms, meta)
    }

    fn release(mut self) {
        self.settled = true;
        self.governor.release(self.identifier);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.governor.release(self.identifier);
        }
    }
}
