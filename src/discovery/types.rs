// ABOUTME: Request and report types for a discovery run.
// ABOUTME: What the caller asks for and the counts it gets back.

use serde::{Deserialize, Serialize};

/// How eagerly a run should go out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Waits twice the recommended delay.
    Low,
    #[default]
    Normal,
    /// Skips the recommended delay.
    High,
}

impl Priority {
    /// Multiple of the governor's recommended delay to wait before searching.
    pub fn delay_factor(&self) -> u32 {
        match self {
            Priority::Low => 2,
            Priority::Normal => 1,
            Priority::High => 0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// One discovery run for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub agent_id: String,

    /// Keywords to search. Empty means the agent's configured keywords.
    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(default)]
    pub priority: Priority,
}

impl DiscoveryRequest {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            keywords: Vec::new(),
            priority: Priority::default(),
        }
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of a completed discovery run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub run_id: String,
    pub agent_id: String,

    /// Session the search ran on; None when served from cache.
    pub session_id: Option<String>,

    /// Posts returned by the search (or the cache) before deduplication.
    pub total_found: usize,

    /// Leads created or updated.
    pub saved: usize,
    pub created: usize,
    pub updated: usize,

    /// Posts that duplicated another post in the batch or a stored lead.
    pub duplicates_skipped: usize,

    pub hot: usize,
    pub medium: usize,
    pub cold: usize,

    /// Posts that could not be persisted, plus one for a search that failed.
    pub errors: usize,

    /// Why the search failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_error: Option<String>,

    /// Compliance alerts raised by this run.
    pub alerts: usize,

    pub from_cache: bool,
    pub duration_ms: u64,
}
