// ABOUTME: ComplianceGovernor - multi-window admission, anomaly detection and enforcement.
// ABOUTME: All mutable state sits behind one mutex so window groups update atomically.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::alert::{AlertLog, AlertType, ComplianceAlert, EnforcementAction, Severity};
use super::window::{RateWindow, WindowKind, WindowSet};
use crate::clock::{Clock, add_saturating, chrono_duration, millis_until, sub_saturating};
use crate::config::GovernorConfig;

/// How often `admit` sweeps stale state on its own.
const GC_INTERVAL: Duration = Duration::from_secs(3_600);

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    Window(WindowKind),
    Concurrency,
    Paused,
    Stopped,
    Blacklisted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Window(kind) => kind.as_str(),
            DenyReason::Concurrency => "concurrency",
            DenyReason::Paused => "paused",
            DenyReason::Stopped => "stopped",
            DenyReason::Blacklisted => "blacklisted",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `admit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after_ms: Option<u64>,
}

impl AdmitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after_ms: None,
        }
    }

    fn deny(reason: DenyReason, retry_after_ms: Option<u64>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after_ms,
        }
    }
}

/// Context for `report_completion`.
#[derive(Debug, Clone, Default)]
pub struct CompletionMeta {
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    /// Raw response text, scanned for blocking phrases.
    pub response_body: Option<String>,
}

impl CompletionMeta {
    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.response_body = Some(body.into());
        self
    }
}

/// Durable enforcement on an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Paused { until: DateTime<Utc> },
    Stopped,
    Blacklisted,
}

impl Block {
    fn rank(&self) -> u8 {
        match self {
            Block::Paused { .. } => 1,
            Block::Stopped => 2,
            Block::Blacklisted => 3,
        }
    }

    fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            Block::Paused { until } => now < *until,
            _ => true,
        }
    }
}

/// Snapshot of one identifier's windows.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUsage {
    pub kind: WindowKind,
    pub count: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    at: DateTime<Utc>,
    success: bool,
    response_time_ms: u64,
}

struct GovernorState {
    windows: HashMap<String, WindowSet>,
    in_flight: usize,
    blocks: HashMap<String, Block>,
    history: HashMap<String, VecDeque<Completion>>,
    recent_alerts: HashMap<String, VecDeque<DateTime<Utc>>>,
    alerts: AlertLog,
    last_gc: DateTime<Utc>,
}

/// Rate limiter, anomaly detector and enforcer.
///
/// Identifiers are opaque strings; the discovery service admits per agent
/// and blacklists per session.
pub struct ComplianceGovernor {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    blocking: Option<Regex>,
    state: Mutex<GovernorState>,
    sink: broadcast::Sender<ComplianceAlert>,
}

impl ComplianceGovernor {
    pub fn new(config: GovernorConfig, clock: Arc<dyn Clock>) -> Self {
        let blocking = blocking_pattern(&config.blocking_phrases);
        let (sink, _) = broadcast::channel(config.alert_buffer.clamp(16, 4_096));
        let now = clock.now();

        Self {
            state: Mutex::new(GovernorState {
                windows: HashMap::new(),
                in_flight: 0,
                blocks: HashMap::new(),
                history: HashMap::new(),
                recent_alerts: HashMap::new(),
                alerts: AlertLog::new(config.alert_buffer),
                last_gc: now,
            }),
            config,
            clock,
            blocking,
            sink,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Decide whether `identifier` may start a request now.
    ///
    /// Checks enforcement, then burst, minute, hour and day windows, then the
    /// global concurrency ceiling. The first violation wins. On allow, all four
    /// windows and the in-flight count go up together.
    pub fn admit(&self, identifier: &str) -> AdmitDecision {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if now - state.last_gc >= chrono_duration(GC_INTERVAL) {
            Self::collect(state, &self.config, now);
        }

        if let Some(block) = state.blocks.get(identifier).filter(|b| b.is_active(now)) {
            let (reason, retry_after_ms) = match block {
                Block::Paused { until } => (DenyReason::Paused, Some(millis_until(now, *until))),
                Block::Stopped => (DenyReason::Stopped, None),
                Block::Blacklisted => (DenyReason::Blacklisted, None),
            };
            debug!(identifier, reason = reason.as_str(), "admission denied");
            return AdmitDecision::deny(reason, retry_after_ms);
        }

        let windows = state
            .windows
            .entry(identifier.to_string())
            .or_insert_with(|| WindowSet::new(&self.config, now));
        windows.roll(now);

        if let Some((kind, window)) = windows.first_full() {
            let retry = window.retry_after_ms(now);
            debug!(identifier, window = kind.as_str(), retry_after_ms = retry, "admission denied");
            return AdmitDecision::deny(DenyReason::Window(kind), Some(retry));
        }

        if state.in_flight >= self.config.max_concurrent {
            debug!(identifier, in_flight = state.in_flight, "admission denied: concurrency");
            return AdmitDecision::deny(
                DenyReason::Concurrency,
                Some(self.config.base_delay.as_millis() as u64),
            );
        }

        windows.increment(now);
        state.in_flight += 1;
        AdmitDecision::allow()
    }

    /// Feed one finished request into the anomaly detector.
    ///
    /// Returns the alerts raised; their enforcement has already been applied
    /// to the governor's own state. Also returns the request's concurrency slot.
    pub fn report_completion(
        &self,
        identifier: &str,
        success: bool,
        response_time_ms: u64,
        meta: CompletionMeta,
    ) -> Vec<ComplianceAlert> {
        let now = self.clock.now();
        let horizon = sub_saturating(now, self.config.anomaly_window);
        let mut raised = Vec::new();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.in_flight = state.in_flight.saturating_sub(1);

        let phrase = match (self.blocking.as_ref(), meta.response_body.as_deref()) {
            (Some(re), Some(body)) => re.find(body).map(|m| m.as_str().to_string()),
            _ => None,
        };
        if let Some(phrase) = phrase {
            raised.push(self.alert(
                AlertType::BlockingDetected,
                Severity::Critical,
                identifier,
                &meta,
                format!("response contains blocking phrase {:?}", phrase),
                now,
            ));
        }

        let history = state.history.entry(identifier.to_string()).or_default();
        history.push_back(Completion {
            at: now,
            success,
            response_time_ms,
        });
        while history.front().is_some_and(|c| c.at < horizon) {
            history.pop_front();
        }

        let samples = history.len();
        if samples >= self.config.min_failure_samples.max(1) {
            let failures = history.iter().filter(|c| !c.success).count();
            let rate = failures as f64 / samples as f64;
            if rate > self.config.failure_rate_threshold {
                let severity = if rate >= 0.8 {
                    Severity::High
                } else {
                    Severity::Medium
                };
                raised.push(self.alert(
                    AlertType::HighFailureRate,
                    severity,
                    identifier,
                    &meta,
                    format!(
                        "{} of {} requests failed in the last {}s",
                        failures,
                        samples,
                        self.config.anomaly_window.as_secs()
                    ),
                    now,
                ));
                history.clear();
            }
        }

        if history.len() >= self.config.min_latency_samples.max(1) {
            let avg = history.iter().map(|c| c.response_time_ms).sum::<u64>() / history.len() as u64;
            if avg > self.config.latency_threshold.as_millis() as u64 {
                raised.push(self.alert(
                    AlertType::HighLatency,
                    Severity::Low,
                    identifier,
                    &meta,
                    format!("average response time {}ms", avg),
                    now,
                ));
                history.clear();
            }
        }

        for alert in &raised {
            Self::enforce(state, alert, now, self.config.pause_duration);
            state
                .recent_alerts
                .entry(identifier.to_string())
                .or_default()
                .push_back(now);
            state.alerts.push(alert.clone());
        }
        drop(guard);

        for alert in &raised {
            log_alert(alert);
            // no subscribers is fine
            let _ = self.sink.send(alert.clone());
        }
        raised
    }

    /// Give back a concurrency slot without reporting an outcome.
    pub fn release(&self, identifier: &str) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        debug!(identifier, in_flight = state.in_flight, "admission released");
    }

    /// Suggested wait before the next request for `identifier`.
    ///
    /// Base delay, jittered by a factor in [0.5, 1.5], scaled up by half the
    /// base for every alert raised against the identifier in the anomaly window.
    pub fn recommended_delay(&self, identifier: &str) -> Duration {
        let now = self.clock.now();
        let horizon = sub_saturating(now, self.config.anomaly_window);

        let recent = {
            let mut state = self.state.lock();
            match state.recent_alerts.get_mut(identifier) {
                Some(times) => {
                    while times.front().is_some_and(|t| *t < horizon) {
                        times.pop_front();
                    }
                    times.len()
                }
                None => 0,
            }
        };

        let jitter: f64 = rand::rng().random_range(0.5..=1.5);
        let multiplier = 1.0 + 0.5 * recent as f64;
        self.config.base_delay.mul_f64(jitter * multiplier)
    }

    /// Block `identifier` until `duration` from now. Never weakens a stronger block.
    pub fn pause(&self, identifier: &str, duration: Duration) {
        let until = add_saturating(self.clock.now(), duration);
        let mut state = self.state.lock();
        Self::apply_block(&mut state, identifier, Block::Paused { until });
        info!(identifier, %until, "identifier paused");
    }

    /// Block `identifier` until resumed.
    pub fn stop(&self, identifier: &str) {
        let mut state = self.state.lock();
        Self::apply_block(&mut state, identifier, Block::Stopped);
        warn!(identifier, "identifier stopped");
    }

    /// Block `identifier` for good.
    pub fn blacklist(&self, identifier: &str) {
        let mut state = self.state.lock();
        Self::apply_block(&mut state, identifier, Block::Blacklisted);
        warn!(identifier, "identifier blacklisted");
    }

    /// Lift a pause or stop. Blacklists stay. Returns whether anything was lifted.
    pub fn resume(&self, identifier: &str) -> bool {
        let mut state = self.state.lock();
        match state.blocks.get(identifier) {
            Some(Block::Blacklisted) | None => false,
            Some(_) => {
                state.blocks.remove(identifier);
                info!(identifier, "identifier resumed");
                true
            }
        }
    }

    /// The enforcement currently in effect for `identifier`, if any.
    pub fn block(&self, identifier: &str) -> Option<Block> {
        let now = self.clock.now();
        self.state
            .lock()
            .blocks
            .get(identifier)
            .copied()
            .filter(|b| b.is_active(now))
    }

    pub fn is_blocked(&self, identifier: &str) -> bool {
        self.block(identifier).is_some()
    }

    /// Up to `limit` most recent alerts, oldest first.
    pub fn alerts(&self, limit: usize) -> Vec<ComplianceAlert> {
        self.state.lock().alerts.recent(limit)
    }

    /// Stream of alerts as they are raised.
    pub fn subscribe(&self) -> broadcast::Receiver<ComplianceAlert> {
        self.sink.subscribe()
    }

    /// Requests admitted and not yet completed or released.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Current window counters for `identifier`.
    pub fn usage(&self, identifier: &str) -> Vec<WindowUsage> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(windows) = state.windows.get_mut(identifier) else {
            return Vec::new();
        };
        windows.roll(now);
        windows
            .snapshot()
            .into_iter()
            .map(|(kind, w): (WindowKind, RateWindow)| WindowUsage {
                kind,
                count: w.count,
                limit: w.limit.limit,
                reset_at: w.reset_at,
            })
            .collect()
    }

    /// Drop idle windows, expired pauses and aged-out anomaly history.
    ///
    /// Returns how many identifiers' windows were dropped.
    pub fn collect_garbage(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        Self::collect(&mut state, &self.config, now)
    }

    fn collect(state: &mut GovernorState, config: &GovernorConfig, now: DateTime<Utc>) -> usize {
        let horizon = sub_saturating(now, config.anomaly_window);

        let before = state.windows.len();
        state.windows.retain(|_, w| !w.is_stale(now));
        let dropped = before - state.windows.len();

        state.blocks.retain(|_, b| b.is_active(now));
        state.history.retain(|_, h| {
            while h.front().is_some_and(|c| c.at < horizon) {
                h.pop_front();
            }
            !h.is_empty()
        });
        state.recent_alerts.retain(|_, times| {
            while times.front().is_some_and(|t| *t < horizon) {
                times.pop_front();
            }
            !times.is_empty()
        });
        state.last_gc = now;

        if dropped > 0 {
            debug!(dropped, "rate windows collected");
        }
        dropped
    }

    fn enforce(
        state: &mut GovernorState,
        alert: &ComplianceAlert,
        now: DateTime<Utc>,
        pause: Duration,
    ) {
        let block = match alert.action {
            EnforcementAction::Log => return,
            EnforcementAction::Pause => Block::Paused {
                until: add_saturating(now, pause),
            },
            EnforcementAction::Stop => Block::Stopped,
            EnforcementAction::Blacklist => Block::Blacklisted,
        };
        Self::apply_block(state, alert.target(), block);
    }

    fn apply_block(state: &mut GovernorState, identifier: &str, block: Block) {
        let keep_existing = state
            .blocks
            .get(identifier)
            .is_some_and(|existing| existing.rank() > block.rank());
        if !keep_existing {
            state.blocks.insert(identifier.to_string(), block);
        }
    }

    fn alert(
        &self,
        alert_type: AlertType,
        severity: Severity,
        identifier: &str,
        meta: &CompletionMeta,
        message: String,
        now: DateTime<Utc>,
    ) -> ComplianceAlert {
        ComplianceAlert {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            severity,
            action: severity.action(),
            identifier: identifier.to_string(),
            agent_id: meta.agent_id.clone(),
            session_id: meta.session_id.clone(),
            message,
            timestamp: now,
        }
    }
}

fn log_alert(alert: &ComplianceAlert) {
    if alert.severity == Severity::Critical {
        error!(
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            action = %alert.action,
            target = alert.target(),
            message = %alert.message,
            "compliance alert"
        );
    } else {
        warn!(
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            action = %alert.action,
            target = alert.target(),
            message = %alert.message,
            "compliance alert"
        );
    }
}

/// Case-insensitive alternation over the configured phrases.
fn blocking_pattern(phrases: &[String]) -> Option<Regex> {
    let parts: Vec<String> = phrases
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(regex::escape)
        .collect();
    if parts.is_empty() {
        return None;
    }

    match RegexBuilder::new(&parts.join("|"))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(error = %e, "invalid blocking phrase pattern, detection disabled");
            None
        }
    }
}
