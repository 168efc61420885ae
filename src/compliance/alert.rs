// ABOUTME: Compliance alert records, severities and the enforcement each maps to.
// ABOUTME: Alerts are immutable values; the log keeps a bounded, oldest-first-evicted buffer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the anomaly detector saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Response body matched a known blocking or CAPTCHA phrase.
    BlockingDetected,
    /// Failure rate over the anomaly window exceeded the threshold.
    HighFailureRate,
    /// Average response time over the anomaly window exceeded the threshold.
    HighLatency,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::BlockingDetected => write!(f, "blocking_detected"),
            AlertType::HighFailureRate => write!(f, "high_failure_rate"),
            AlertType::HighLatency => write!(f, "high_latency"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// The enforcement applied for an alert of this severity.
    pub fn action(&self) -> EnforcementAction {
        match self {
            Severity::Low => EnforcementAction::Log,
            Severity::Medium => EnforcementAction::Pause,
            Severity::High => EnforcementAction::Stop,
            Severity::Critical => EnforcementAction::Blacklist,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    Log,
    Pause,
    Stop,
    Blacklist,
}

impl std::fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnforcementAction::Log => write!(f, "log"),
            EnforcementAction::Pause => write!(f, "pause"),
            EnforcementAction::Stop => write!(f, "stop"),
            EnforcementAction::Blacklist => write!(f, "blacklist"),
        }
    }
}

/// One anomaly, with the enforcement that was applied for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceAlert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub action: EnforcementAction,

    /// The governor identifier the completion was reported under.
    pub identifier: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,

    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ComplianceAlert {
    /// The identifier enforcement lands on: the session for a blacklist, otherwise the reporter.
    pub fn target(&self) -> &str {
        match (self.action, self.session_id.as_deref()) {
            (EnforcementAction::Blacklist, Some(session_id)) => session_id,
            _ => &self.identifier,
        }
    }
}

/// Bounded alert history, oldest evicted first.
#[derive(Debug)]
pub(crate) struct AlertLog {
    entries: VecDeque<ComplianceAlert>,
    capacity: usize,
}

impl AlertLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1_024)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, alert: ComplianceAlert) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(alert);
    }

    /// Up to `limit` most recent alerts, oldest first.
    pub(crate) fn recent(&self, limit: usize) -> Vec<ComplianceAlert> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
