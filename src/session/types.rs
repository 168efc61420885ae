// ABOUTME: Session record, lifecycle status, and health report types.
// ABOUTME: Health score is kept in [0,1] by construction via set_health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, liveness check not yet passed.
    Validating,
    /// Usable.
    Active,
    /// Remaining TTL is under the refresh threshold; waiting for refresh.
    Expiring,
    /// A refresh is in progress.
    Refreshing,
    /// Lifetime ended or refresh exhausted.
    Expired,
    /// Too many consecutive failures.
    Failed,
    /// Removed by compliance enforcement.
    Blacklisted,
}

impl SessionStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Expired | SessionStatus::Failed | SessionStatus::Blacklisted
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Validating => write!(f, "validating"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Expiring => write!(f, "expiring"),
            SessionStatus::Refreshing => write!(f, "refreshing"),
            SessionStatus::Expired => write!(f, "expired"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Blacklisted => write!(f, "blacklisted"),
        }
    }
}

/// One authenticated automation identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub account_id: String,

    /// Credentials as produced by the cipher. Never plaintext.
    pub credential_blob: Vec<u8>,

    pub user_agent: String,

    health_score: f64,

    pub failure_count: u32,
    pub success_count: u32,
    pub consecutive_failures: u32,

    /// Exponentially weighted response time.
    pub avg_response_ms: f64,

    pub status: SessionStatus,

    /// Why the session last left the Active state.
    pub status_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// A new session in Validating state with full health.
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        credential_blob: Vec<u8>,
        user_agent: impl Into<String>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            credential_blob,
            user_agent: user_agent.into(),
            health_score: 1.0,
            failure_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            avg_response_ms: 0.0,
            status: SessionStatus::Validating,
            status_reason: None,
            created_at: now,
            last_activity_at: now,
            expires_at,
        }
    }

    pub fn health_score(&self) -> f64 {
        self.health_score
    }

    /// Set the health score, clamped to [0,1]. NaN becomes 0.
    pub fn set_health(&mut self, score: f64) {
        self.health_score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };
    }

    /// Time left before expiry; negative once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }

    /// Failure rate over `max(total, floor)` operations.
    pub fn failure_rate(&self, floor: u32) -> f64 {
        let total = (self.success_count + self.failure_count).max(floor).max(1);
        self.failure_count as f64 / total as f64
    }

    /// Eligible for acquisition: Active, healthy enough, not past expiry.
    pub fn is_acquirable(&self, now: DateTime<Utc>, min_health: f64) -> bool {
        self.status == SessionStatus::Active
            && self.health_score >= min_health
            && self.expires_at > now
    }

    /// Move to a new status, recording why.
    pub(crate) fn transition(&mut self, status: SessionStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        if status == SessionStatus::Blacklisted {
            self.health_score = 0.0;
        }
    }
}

/// Result of `compute_health`.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub score: f64,
    pub is_healthy: bool,
    pub issues: Vec<String>,
}

/// Aggregate view over all live sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub expiring: usize,
    pub expired: usize,
    pub failed: usize,
    pub blacklisted: usize,
    pub average_health: f64,
}

/// What one refresh sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    /// Sessions moved from Active to Expiring.
    pub marked_expiring: Vec<String>,
    /// Sessions refreshed back to Active.
    pub refreshed: Vec<String>,
    /// Sessions expired (lifetime over or refresh exhausted).
    pub expired: Vec<String>,
}
