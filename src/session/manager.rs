// ABOUTME: SessionLifecycleManager - creation, acquisition, health scoring and refresh.
// ABOUTME: Every read-modify-write of a session is serialized by its own mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{HealthReport, RefreshReport, Session, SessionStats, SessionStatus};
use crate::automation::{AutomationSession, SessionProbe};
use crate::cipher::Cipher;
use crate::clock::{Clock, add_saturating, chrono_duration};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::hook::{HookEvent, HookRegistry, fire_opt};
use crate::store::{DirectoryStore, SessionStore};

type SessionEntry = Arc<Mutex<Session>>;

/// Outcome of refreshing one session.
enum RefreshOutcome {
    Refreshed,
    Expired,
    Skipped,
}

/// Owns the live session registry.
///
/// Sessions are held one mutex each. A mutation clones the session, applies
/// the change, persists the clone, and only then replaces the live copy, so a
/// store failure leaves the session as it was.
pub struct SessionLifecycleManager {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn DirectoryStore>,
    cipher: Arc<dyn Cipher>,
    probe: Arc<dyn SessionProbe>,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    available: Notify,
    refreshing: Arc<parking_lot::Mutex<HashSet<String>>>,
    hooks: Option<Arc<HookRegistry>>,
}

impl SessionLifecycleManager {
    /// Create a manager with an empty registry. Call `hydrate` to load persisted sessions.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn DirectoryStore>,
        cipher: Arc<dyn Cipher>,
        probe: Arc<dyn SessionProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            directory,
            cipher,
            probe,
            clock,
            sessions: RwLock::new(HashMap::new()),
            available: Notify::new(),
            refreshing: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            hooks: None,
        }
    }

    /// Fire lifecycle events into this registry.
    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create, validate and register a new session.
    ///
    /// The credentials are encrypted first and checked against the target
    /// second; nothing is persisted unless both succeed.
    pub async fn create(
        &self,
        account_id: &str,
        credentials: &[u8],
        user_agent: &str,
    ) -> Result<Session, SessionError> {
        match self.directory.get_account(account_id).await? {
            Some(account) if account.active => {}
            _ => return Err(SessionError::AccountNotFound(account_id.to_string())),
        }

        let blob = self.cipher.encrypt(credentials).await?;

        let validation = match tokio::time::timeout(
            self.config.probe_timeout,
            self.probe.validate(credentials, user_agent),
        )
        .await
        {
            Ok(Ok(validation)) => validation,
            Ok(Err(e)) => return Err(SessionError::ValidationFailed(e.to_string())),
            Err(_) => {
                return Err(SessionError::ValidationFailed(format!(
                    "validation timed out after {:?}",
                    self.config.probe_timeout
                )));
            }
        };

        let now = self.clock.now();
        let expires_at = validation
            .expires_at
            .unwrap_or_else(|| add_saturating(now, self.config.session_ttl));

        let mut session = Session::new(
            uuid::Uuid::new_v4().to_string(),
            account_id,
            blob,
            user_agent,
            now,
            expires_at,
        );
        session.transition(SessionStatus::Active, None);

        self.store.save_session(&session).await?;
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        self.available.notify_waiters();

        info!(session_id = %session.id, account_id, %expires_at, "session created");
        Ok(session)
    }

    /// Load persisted sessions that are not yet in the live registry.
    ///
    /// Returns how many were added.
    pub async fn hydrate(&self) -> Result<usize, SessionError> {
        let persisted = self.store.list_sessions().await?;
        let mut sessions = self.sessions.write().await;

        let mut added = 0;
        for session in persisted {
            if sessions.contains_key(&session.id) {
                continue;
            }
            sessions.insert(session.id.clone(), Arc::new(Mutex::new(session)));
            added += 1;
        }
        drop(sessions);

        if added > 0 {
            self.available.notify_waiters();
        }
        debug!(added, "sessions hydrated");
        Ok(added)
    }

    /// Pick the best usable session, if any.
    ///
    /// Highest health wins; ties go to the least recently used. Returns
    /// `Ok(None)` when nothing is eligible.
    pub async fn acquire(&self, account_id: Option<&str>) -> Result<Option<Session>, SessionError> {
        self.acquire_excluding(account_id, &HashSet::new()).await
    }

    /// Like `acquire`, skipping the sessions in `exclude`.
    pub async fn acquire_excluding(
        &self,
        account_id: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Result<Option<Session>, SessionError> {
        let now = self.clock.now();
        let min_health = self.config.min_health;

        let mut candidates: Vec<(f64, DateTime<Utc>, String, SessionEntry)> = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, entry) in sessions.iter() {
                let session = entry.lock().await;
                if account_id.is_some_and(|a| a != session.account_id) || exclude.contains(id) {
                    continue;
                }
                if session.is_acquirable(now, min_health) {
                    candidates.push((
                        session.health_score(),
                        session.last_activity_at,
                        id.clone(),
                        entry.clone(),
                    ));
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        for (_, _, id, entry) in candidates {
            let mut guard = entry.lock().await;
            // state may have moved between the snapshot and now
            if !guard.is_acquirable(now, min_health) {
                continue;
            }

            let mut next = guard.clone();
            next.last_activity_at = now;
            self.store.save_session(&next).await?;
            *guard = next.clone();

            debug!(session_id = %id, health = next.health_score(), "session acquired");
            return Ok(Some(next));
        }

        Ok(None)
    }

    /// Like `acquire`, but waits up to `timeout` for a session to become usable.
    ///
    /// Wakes when a session is created, refreshed or recovers health.
    /// Returns `Ok(None)` on timeout.
    pub async fn acquire_wait(
        &self,
        account_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<Session>, SessionError> {
        self.acquire_wait_excluding(account_id, &HashSet::new(), timeout)
            .await
    }

    /// Like `acquire_wait`, skipping the sessions in `exclude`.
    pub async fn acquire_wait_excluding(
        &self,
        account_id: Option<&str>,
        exclude: &HashSet<String>,
        timeout: Duration,
    ) -> Result<Option<Session>, SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(session) = self.acquire_excluding(account_id, exclude).await? {
                return Ok(Some(session));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(self.config.acquire_poll_interval);

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Record the result of one automation run on a session.
    ///
    /// Reports against terminal sessions are ignored.
    pub async fn report_outcome(
        &self,
        session_id: &str,
        success: bool,
        response_time_ms: u64,
    ) -> Result<(), SessionError> {
        let entry = self.entry(session_id).await?;
        let mut guard = entry.lock().await;
        if guard.status.is_terminal() {
            debug!(session_id, status = %guard.status, "outcome ignored for terminal session");
            return Ok(());
        }

        let now = self.clock.now();
        let mut next = guard.clone();
        next.last_activity_at = now;

        let rt = response_time_ms as f64;
        next.avg_response_ms = if next.success_count + next.failure_count == 0 {
            rt
        } else {
            0.8 * next.avg_response_ms + 0.2 * rt
        };

        if success {
            next.success_count += 1;
            next.consecutive_failures = 0;
            let ratio =
                next.success_count as f64 / (next.success_count + next.failure_count) as f64;
            next.set_health(next.health_score() + self.config.success_step * ratio);
        } else {
            next.failure_count += 1;
            next.consecutive_failures += 1;
            next.set_health(next.health_score() - self.config.failure_penalty);

            let max = self.config.max_consecutive_failures;
            if max > 0 && next.consecutive_failures >= max {
                next.transition(
                    SessionStatus::Failed,
                    Some(format!("{} consecutive failures", next.consecutive_failures)),
                );
            }
        }

        self.store.save_session(&next).await?;
        let recovered = !guard.is_acquirable(now, self.config.min_health)
            && next.is_acquirable(now, self.config.min_health);
        *guard = next;

        if guard.status == SessionStatus::Failed {
            warn!(
                session_id,
                failures = guard.consecutive_failures,
                "session failed after consecutive failures"
            );
        } else {
            debug!(session_id, success, health = guard.health_score(), "outcome recorded");
        }
        drop(guard);

        if recovered {
            self.available.notify_waiters();
        }
        Ok(())
    }

    /// Evaluate a session's health from its current state.
    pub async fn compute_health(&self, session_id: &str) -> Result<HealthReport, SessionError> {
        let session = self.snapshot(session_id).await?;
        let now = self.clock.now();

        let mut score = session.health_score();
        let mut issues = Vec::new();

        if session.status != SessionStatus::Active {
            issues.push(format!("session is {}", session.status));
        }

        let remaining = session.remaining_ttl(now);
        if remaining < chrono_duration(self.config.refresh_threshold) {
            score *= 0.8;
            if remaining <= chrono::Duration::zero() {
                issues.push("session has expired".to_string());
            } else {
                issues.push(format!(
                    "session expires in {} minutes",
                    remaining.num_minutes()
                ));
            }
        }

        let idle = now - session.last_activity_at;
        if idle > chrono_duration(self.config.health_check_interval) {
            score *= 0.9;
            issues.push(format!("no activity for {} minutes", idle.num_minutes()));
        }

        let failure_rate = session.failure_rate(self.config.failure_estimate_floor);
        if failure_rate > 0.1 {
            score *= 1.0 - failure_rate;
            issues.push(format!(
                "high failure rate: {:.0}%",
                failure_rate * 100.0
            ));
        }

        let score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };
        Ok(HealthReport {
            score,
            is_healthy: score >= self.config.min_health,
            issues,
        })
    }

    /// Permanently remove a session from use.
    pub async fn blacklist(&self, session_id: &str, reason: &str) -> Result<(), SessionError> {
        if self
            .retire(session_id, SessionStatus::Blacklisted, reason)
            .await?
        {
            warn!(session_id, reason, "session blacklisted");
            fire_opt(
                &self.hooks,
                HookEvent::SessionBlacklisted {
                    session_id: session_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await;
        }
        Ok(())
    }

    /// Mark a session Expired, e.g. after the target rejected it.
    pub async fn expire(&self, session_id: &str, reason: &str) -> Result<(), SessionError> {
        if self.retire(session_id, SessionStatus::Expired, reason).await? {
            info!(session_id, reason, "session expired");
            self.fire_expired(session_id, reason).await;
        }
        Ok(())
    }

    /// Snapshot of one session.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.snapshot(session_id).await.ok()
    }

    /// Snapshots of all sessions, optionally for one account, oldest first.
    pub async fn list(&self, account_id: Option<&str>) -> Vec<Session> {
        let entries: Vec<SessionEntry> = self.sessions.read().await.values().cloned().collect();

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let session = entry.lock().await.clone();
            if account_id.is_none_or(|a| a == session.account_id) {
                out.push(session);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Decrypted credentials for handing a session to an automation instance.
    pub async fn credentials(&self, session_id: &str) -> Result<AutomationSession, SessionError> {
        let session = self.snapshot(session_id).await?;
        if session.status.is_terminal() {
            return Err(SessionError::Unusable {
                id: session.id,
                status: session.status.to_string(),
            });
        }

        let credentials = self.cipher.decrypt(&session.credential_blob).await?;
        Ok(AutomationSession {
            session_id: session.id,
            account_id: session.account_id,
            credentials,
            user_agent: session.user_agent,
        })
    }

    pub async fn stats(&self) -> SessionStats {
        let sessions = self.list(None).await;
        let mut stats = SessionStats {
            total: sessions.len(),
            ..Default::default()
        };

        let mut live_health = Vec::new();
        for session in &sessions {
            match session.status {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Expiring | SessionStatus::Refreshing => stats.expiring += 1,
                SessionStatus::Expired => stats.expired += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Blacklisted => stats.blacklisted += 1,
                SessionStatus::Validating => {}
            }
            if !session.status.is_terminal() {
                live_health.push(session.health_score());
            }
        }

        if !live_health.is_empty() {
            stats.average_health = live_health.iter().sum::<f64>() / live_health.len() as f64;
        }
        stats
    }

    /// One pass of the refresh routine.
    ///
    /// Expires sessions past their lifetime, moves Active sessions under the
    /// refresh threshold to Expiring, and refreshes every Expiring session
    /// with bounded retries.
    pub async fn refresh_sweep(&self) -> RefreshReport {
        let now = self.clock.now();
        let threshold = chrono_duration(self.config.refresh_threshold);
        let mut report = RefreshReport::default();
        let mut due = Vec::new();

        let entries: Vec<(String, SessionEntry)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        for (id, entry) in entries {
            let mut guard = entry.lock().await;
            let live = matches!(guard.status, SessionStatus::Active | SessionStatus::Expiring);

            if live && guard.expires_at <= now {
                let mut next = guard.clone();
                next.transition(SessionStatus::Expired, Some("lifetime ended".into()));
                if let Err(e) = self.store.save_session(&next).await {
                    warn!(session_id = %id, error = %e, "failed to persist expiry");
                    continue;
                }
                *guard = next;
                drop(guard);
                info!(session_id = %id, "session lifetime ended");
                self.fire_expired(&id, "lifetime ended").await;
                report.expired.push(id);
                continue;
            }

            if guard.status == SessionStatus::Active && guard.remaining_ttl(now) < threshold {
                let mut next = guard.clone();
                next.transition(
                    SessionStatus::Expiring,
                    Some("remaining ttl below refresh threshold".into()),
                );
                if let Err(e) = self.store.save_session(&next).await {
                    warn!(session_id = %id, error = %e, "failed to persist expiring state");
                    continue;
                }
                *guard = next;
                debug!(session_id = %id, "session expiring");
                report.marked_expiring.push(id.clone());
            }

            // a sweep dropped mid-refresh leaves its sessions Refreshing and unclaimed
            let abandoned = guard.status == SessionStatus::Refreshing
                && !self.refreshing.lock().contains(&id);
            if guard.status == SessionStatus::Expiring || abandoned {
                let Some(claim) = RefreshClaim::take(&self.refreshing, &id) else {
                    continue;
                };
                if abandoned {
                    debug!(session_id = %id, "resuming abandoned refresh");
                } else {
                    let mut next = guard.clone();
                    next.transition(SessionStatus::Refreshing, None);
                    if let Err(e) = self.store.save_session(&next).await {
                        warn!(session_id = %id, error = %e, "failed to persist refreshing state");
                        continue;
                    }
                    *guard = next;
                }
                due.push((id, entry.clone(), claim));
            }
        }

        let outcomes = join_all(due.into_iter().map(|(id, entry, claim)| async move {
            let outcome = self.refresh_one(&id, &entry).await;
            drop(claim);
            (outcome, id)
        }))
        .await;

        for (outcome, id) in outcomes {
            match outcome {
                RefreshOutcome::Refreshed => report.refreshed.push(id),
                RefreshOutcome::Expired => report.expired.push(id),
                RefreshOutcome::Skipped => {}
            }
        }

        if !report.refreshed.is_empty() {
            self.available.notify_waiters();
        }
        report
    }

    /// Run `refresh_sweep` every `refresh_interval` until the handle is shut down.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> RefreshLoopHandle {
        let manager = Arc::clone(self);
        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let period = self.config.refresh_interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = stop_signal.notified() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            () = stop_signal.notified() => break,
                            report = manager.refresh_sweep() => debug!(
                                marked_expiring = report.marked_expiring.len(),
                                refreshed = report.refreshed.len(),
                                expired = report.expired.len(),
                                "refresh sweep finished"
                            ),
                        }
                    }
                }
            }
            debug!("refresh loop stopped");
        });

        RefreshLoopHandle { stop, task }
    }

    async fn refresh_one(&self, id: &str, entry: &SessionEntry) -> RefreshOutcome {
        let attempts = self.config.refresh_attempts.max(1);
        let mut last_error = String::new();

        let context = match self.refresh_context(entry).await {
            Ok(context) => Some(context),
            Err(e) => {
                last_error = e.to_string();
                None
            }
        };

        if let Some(context) = context {
            for attempt in 0..attempts {
                if attempt > 0 {
                    let backoff = self.config.refresh_backoff * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }

                match tokio::time::timeout(self.config.probe_timeout, self.probe.refresh(&context))
                    .await
                {
                    Ok(Ok(refreshed)) => {
                        return self
                            .commit_refresh(id, entry, refreshed.credentials, refreshed.expires_at)
                            .await;
                    }
                    Ok(Err(e)) => {
                        debug!(session_id = id, attempt, error = %e, "refresh attempt failed");
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        debug!(session_id = id, attempt, "refresh attempt timed out");
                        last_error = format!("timed out after {:?}", self.config.probe_timeout);
                    }
                }
            }
        }

        let reason = format!("refresh failed after {} attempts: {}", attempts, last_error);
        let mut guard = entry.lock().await;
        if guard.status != SessionStatus::Refreshing {
            return RefreshOutcome::Skipped;
        }
        let mut next = guard.clone();
        next.transition(SessionStatus::Expired, Some(reason.clone()));
        if let Err(e) = self.store.save_session(&next).await {
            warn!(session_id = id, error = %e, "failed to persist refresh exhaustion");
            return RefreshOutcome::Skipped;
        }
        *guard = next;
        drop(guard);

        warn!(session_id = id, reason = %reason, "session expired");
        self.fire_expired(id, &reason).await;
        RefreshOutcome::Expired
    }

    async fn refresh_context(&self, entry: &SessionEntry) -> Result<AutomationSession, SessionError> {
        let session = entry.lock().await.clone();
        let credentials = self.cipher.decrypt(&session.credential_blob).await?;
        Ok(AutomationSession {
            session_id: session.id,
            account_id: session.account_id,
            credentials,
            user_agent: session.user_agent,
        })
    }

    async fn commit_refresh(
        &self,
        id: &str,
        entry: &SessionEntry,
        credentials: Option<Vec<u8>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> RefreshOutcome {
        let blob = match credentials {
            Some(plain) => match self.cipher.encrypt(&plain).await {
                Ok(blob) => Some(blob),
                Err(e) => {
                    warn!(session_id = id, error = %e, "failed to encrypt refreshed credentials");
                    return RefreshOutcome::Skipped;
                }
            },
            None => None,
        };

        let now = self.clock.now();
        let mut guard = entry.lock().await;
        // blacklisted while the refresh was in flight
        if guard.status != SessionStatus::Refreshing {
            return RefreshOutcome::Skipped;
        }

        let mut next = guard.clone();
        if let Some(blob) = blob {
            next.credential_blob = blob;
        }
        next.expires_at =
            expires_at.unwrap_or_else(|| add_saturating(now, self.config.session_ttl));
        next.set_health(next.health_score().max(self.config.refreshed_health));
        next.transition(SessionStatus::Active, None);

        if let Err(e) = self.store.save_session(&next).await {
            warn!(session_id = id, error = %e, "failed to persist refreshed session");
            return RefreshOutcome::Skipped;
        }
        *guard = next;

        info!(session_id = id, expires_at = %guard.expires_at, "session refreshed");
        RefreshOutcome::Refreshed
    }

    /// Move a non-terminal session into a terminal status. Returns false if it was already terminal.
    async fn retire(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: &str,
    ) -> Result<bool, SessionError> {
        let entry = self.entry(session_id).await?;
        let mut guard = entry.lock().await;
        if guard.status.is_terminal() {
            return Ok(false);
        }

        let mut next = guard.clone();
        next.transition(status, Some(reason.to_string()));
        self.store.save_session(&next).await?;
        *guard = next;
        Ok(true)
    }

    async fn fire_expired(&self, session_id: &str, reason: &str) {
        fire_opt(
            &self.hooks,
            HookEvent::SessionExpired {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn entry(&self, session_id: &str) -> Result<SessionEntry, SessionError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn snapshot(&self, session_id: &str) -> Result<Session, SessionError> {
        let entry = self.entry(session_id).await?;
        let session = entry.lock().await.clone();
        Ok(session)
    }
}

/// A running sweep's hold on one session's refresh. Released on drop.
struct RefreshClaim {
    claimed: Arc<parking_lot::Mutex<HashSet<String>>>,
    session_id: String,
}

impl RefreshClaim {
    fn take(claimed: &Arc<parking_lot::Mutex<HashSet<String>>>, session_id: &str) -> Option<Self> {
        claimed.lock().insert(session_id.to_string()).then(|| Self {
            claimed: Arc::clone(claimed),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for RefreshClaim {
    fn drop(&mut self) {
        self.claimed.lock().remove(&self.session_id);
    }
}

/// Handle to the background refresh loop.
pub struct RefreshLoopHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RefreshLoopHandle {
    /// Stop the loop, abandoning a sweep in progress, and wait for the task to end.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "refresh loop task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
