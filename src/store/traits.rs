// ABOUTME: Store traits - the persistence contracts the core requires.
// ABOUTME: Split by concern so backends can implement only what they host.

use async_trait::async_trait;

use super::{Account, Agent, Lead};
use crate::error::StoreError;
use crate::session::Session;

/// Durable storage for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session.
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn load_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;
}

/// Accounts and agents.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn get_account(&self, id: &str) -> Result<Option<Account>, StoreError>;

    async fn save_account(&self, account: &Account) -> Result<(), StoreError>;

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError>;

    async fn save_agent(&self, agent: &Agent) -> Result<(), StoreError>;
}

/// Leads, with the lookups duplicate detection needs. All lookups are scoped to an agent.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn find_lead_by_external_id(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<Option<Lead>, StoreError>;

    async fn find_lead_by_url(
        &self,
        agent_id: &str,
        canonical_url: &str,
    ) -> Result<Option<Lead>, StoreError>;

    async fn find_lead_by_content_hash(
        &self,
        agent_id: &str,
        content_hash: &str,
    ) -> Result<Option<Lead>, StoreError>;

    /// Leads by the same author whose text length (in chars) is within `[min_len, max_len]`.
    async fn find_similar_leads(
        &self,
        agent_id: &str,
        author_handle: &str,
        min_len: usize,
        max_len: usize,
        limit: usize,
    ) -> Result<Vec<Lead>, StoreError>;

    /// Insert a new lead.
    ///
    /// Returns `StoreError::Conflict` when a lead with the same external id,
    /// canonical URL or content hash already exists for the agent.
    async fn create_lead(&self, lead: &Lead) -> Result<(), StoreError>;

    /// Replace an existing lead.
    async fn update_lead(&self, lead: &Lead) -> Result<(), StoreError>;

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>, StoreError>;

    async fn list_leads(&self, agent_id: &str) -> Result<Vec<Lead>, StoreError>;
}
