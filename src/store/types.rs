// ABOUTME: Persistent record types owned by the store: accounts, agents, leads.
// ABOUTME: Sessions live in the session module; the store only persists them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::{EngagementMetrics, SearchOptions};
use crate::scoring::LeadCategory;

/// The owner of sessions and agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub active: bool,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active: true,
        }
    }
}

/// A configured discovery agent: who searches, for what, with which options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub account_id: String,
    pub name: String,

    /// Keywords used when a run does not supply its own.
    pub keywords: Vec<String>,

    pub options: SearchOptions,
    pub active: bool,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        account_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            name: name.into(),
            keywords: Vec::new(),
            options: SearchOptions::default(),
            active: true,
        }
    }

    /// Set the default keywords.
    pub fn keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    /// Set the search options.
    pub fn options(mut self, options: SearchOptions) -> Self {
        self.options = options;
        self
    }
}

/// A persisted, scored post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub agent_id: String,
    pub account_id: String,

    pub external_id: Option<String>,
    pub canonical_url: Option<String>,
    pub content_hash: String,

    pub author_handle: String,
    pub author_name: Option<String>,
    pub text: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub metrics: EngagementMetrics,

    pub score: f64,
    pub category: LeadCategory,
    pub matched_keywords: Vec<String>,

    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}
