// ABOUTME: Data types exchanged with the automation capability.
// ABOUTME: Raw posts, search options, and session validation/refresh results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engagement counters reported alongside a post.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementMetrics {
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub comments: u64,
    #[serde(default)]
    pub shares: u64,
}

impl EngagementMetrics {
    /// Component-wise maximum of two metric sets.
    pub fn merge(&self, other: &EngagementMetrics) -> EngagementMetrics {
        EngagementMetrics {
            likes: self.likes.max(other.likes),
            comments: self.comments.max(other.comments),
            shares: self.shares.max(other.shares),
        }
    }

    /// Weighted interaction count used by lead scoring.
    pub fn weighted_total(&self) -> u64 {
        self.likes + 2 * self.comments + 3 * self.shares
    }
}

/// A post as returned by the automation capability, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPost {
    /// Platform-assigned id, when the extraction captured one.
    #[serde(default)]
    pub external_id: Option<String>,

    /// Permalink to the post.
    #[serde(default)]
    pub url: Option<String>,

    /// Author handle, the grouping key for fuzzy matching.
    pub author_handle: String,

    #[serde(default)]
    pub author_name: Option<String>,

    pub text: String,

    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metrics: EngagementMetrics,
}

impl RawPost {
    /// Create a post with the required fields.
    pub fn new(author_handle: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            external_id: None,
            url: None,
            author_handle: author_handle.into(),
            author_name: None,
            text: text.into(),
            posted_at: None,
            metrics: EngagementMetrics::default(),
        }
    }

    /// Set the external id.
    pub fn external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    /// Set the permalink.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the author display name.
    pub fn author_name(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }

    /// Set the post timestamp.
    pub fn posted_at(mut self, at: DateTime<Utc>) -> Self {
        self.posted_at = Some(at);
        self
    }

    /// Set engagement counters.
    pub fn metrics(mut self, likes: u64, comments: u64, shares: u64) -> Self {
        self.metrics = EngagementMetrics {
            likes,
            comments,
            shares,
        };
        self
    }
}

/// Options passed to a search; part of the cache fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Upper bound on posts returned.
    pub max_results: usize,

    /// Only posts newer than this many hours.
    #[serde(default)]
    pub since_hours: Option<u32>,

    /// Restrict to a content language.
    #[serde(default)]
    pub language: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 50,
            since_hours: None,
            language: None,
        }
    }
}

/// Decrypted session context handed to an automation instance for one task.
#[derive(Debug, Clone)]
pub struct AutomationSession {
    pub session_id: String,
    pub account_id: String,
    pub credentials: Vec<u8>,
    pub user_agent: String,
}

/// Outcome of a successful liveness check.
#[derive(Debug, Clone, Default)]
pub struct SessionValidation {
    /// Expiry reported by the target, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a successful session refresh.
#[derive(Debug, Clone, Default)]
pub struct RefreshedSession {
    /// Replacement credentials, if the target rotated them.
    pub credentials: Option<Vec<u8>>,

    /// New expiry reported by the target, if any.
    pub expires_at: Option<DateTime<Utc>>,
}
