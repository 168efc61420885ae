// ABOUTME: In-memory store implementing every store trait.
// ABOUTME: Useful for tests and local runs; can simulate an outage.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Account, Agent, DirectoryStore, Lead, LeadStore, SessionStore};
use crate::error::StoreError;
use crate::session::Session;

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    agents: HashMap<String, Agent>,
    sessions: HashMap<String, Session>,
    leads: HashMap<String, Lead>,
}

/// In-memory store.
///
/// Enforces the same per-agent uniqueness on leads (external id, canonical
/// URL, content hash) a relational backend would enforce with unique indexes.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in Arc for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every operation fail with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn find_lead<F>(state: &MemoryState, agent_id: &str, pred: F) -> Option<Lead>
    where
        F: Fn(&Lead) -> bool,
    {
        state
            .leads
            .values()
            .filter(|l| l.agent_id == agent_id)
            .find(|l| pred(l))
            .cloned()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.sessions.get(id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.sessions.values().cloned().collect())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.state.write().await.sessions.remove(id);
        Ok(())
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn get_account(&self, id: &str) -> Result<Option<Account>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.accounts.get(id).cloned())
    }

    async fn save_account(&self, account: &Account) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.agents.get(id).cloned())
    }

    async fn save_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .write()
            .await
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn find_lead_by_external_id(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<Option<Lead>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(Self::find_lead(&state, agent_id, |l| {
            l.external_id.as_deref() == Some(external_id)
        }))
    }

    async fn find_lead_by_url(
        &self,
        agent_id: &str,
        canonical_url: &str,
    ) -> Result<Option<Lead>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(Self::find_lead(&state, agent_id, |l| {
            l.canonical_url.as_deref() == Some(canonical_url)
        }))
    }

    async fn find_lead_by_content_hash(
        &self,
        agent_id: &str,
        content_hash: &str,
    ) -> Result<Option<Lead>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(Self::find_lead(&state, agent_id, |l| {
            l.content_hash == content_hash
        }))
    }

    async fn find_similar_leads(
        &self,
        agent_id: &str,
        author_handle: &str,
        min_len: usize,
        max_len: usize,
        limit: usize,
    ) -> Result<Vec<Lead>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut found: Vec<Lead> = state
            .leads
            .values()
            .filter(|l| l.agent_id == agent_id)
            .filter(|l| l.author_handle.eq_ignore_ascii_case(author_handle))
            .filter(|l| {
                let len = l.text.chars().count();
                len >= min_len && len <= max_len
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at).then(a.id.cmp(&b.id)));
        found.truncate(limit);
        Ok(found)
    }

    async fn create_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write().await;

        let conflict = Self::find_lead(&state, &lead.agent_id, |l| {
            (lead.external_id.is_some() && l.external_id == lead.external_id)
                || (lead.canonical_url.is_some() && l.canonical_url == lead.canonical_url)
                || l.content_hash == lead.content_hash
        });
        if let Some(existing) = conflict {
            return Err(StoreError::Conflict {
                kind: "lead",
                existing_id: existing.id,
            });
        }

        state.leads.insert(lead.id.clone(), lead.clone());
        Ok(())
    }

    async fn update_lead(&self, lead: &Lead) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.write().await;
        match state.leads.get_mut(&lead.id) {
            Some(existing) => {
                *existing = lead.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "lead",
                id: lead.id.clone(),
            }),
        }
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StoreError> {
        self.check()?;
        Ok(self.state.read().await.leads.get(id).cloned())
    }

    async fn list_leads(&self, agent_id: &str) -> Result<Vec<Lead>, StoreError> {
        self.check()?;
        let state = self.state.read().await;
        let mut leads: Vec<Lead> = state
            .leads
            .values()
            .filter(|l| l.agent_id == agent_id)
            .cloned()
            .collect();
        leads.sort_by(|a, b| a.first_seen_at.cmp(&b.first_seen_at).then(a.id.cmp(&b.id)));
        Ok(leads)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::automation::EngagementMetrics;
    use crate::scoring::LeadCategory;

    fn lead(id: &str, external_id: Option<&str>, hash: &str) -> Lead {
        let now = Utc::now();
        Lead {
            id: id.into(),
            agent_id: "agent-1".into(),
            account_id: "acct-1".into(),
            external_id: external_id.map(String::from),
            canonical_url: None,
            content_hash: hash.into(),
            author_handle: "jane".into(),
            author_name: None,
            text: "need a new roof before winter".into(),
            posted_at: None,
            metrics: EngagementMetrics::default(),
            score: 0.5,
            category: LeadCategory::Medium,
            matched_keywords: vec![],
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_lead_rejects_duplicate_external_id() {
        let store = MemoryStore::new();
        store.create_lead(&lead("l1", Some("x1"), "h1")).await.unwrap();

        let err = store
            .create_lead(&lead("l2", Some("x1"), "h2"))
            .await
            .unwrap_err();
        match err {
            StoreError::Conflict { existing_id, .. } => assert_eq!(existing_id, "l1"),
            other => panic!("Expected Conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_similar_leads_filter_by_author_and_length() {
        let store = MemoryStore::new();
        store.create_lead(&lead("l1", None, "h1")).await.unwrap();

        let hits = store
            .find_similar_leads("agent-1", "JANE", 10, 60, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = store
            .find_similar_leads("agent-1", "jane", 100, 200, 10)
            .await
            .unwrap();
        assert!(misses.is_empty());

        let other_agent = store
            .find_similar_leads("agent-2", "jane", 10, 60, 10)
            .await
            .unwrap();
        assert!(other_agent.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_sessions().await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.list_sessions().await.is_ok());
    }
}
