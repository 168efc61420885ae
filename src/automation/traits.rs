// ABOUTME: Defines the automation capability traits - the seam between the core
// ABOUTME: and whatever drives the browser (remote service or simulation).

use std::sync::Arc;

use async_trait::async_trait;

use super::{AutomationSession, RawPost, RefreshedSession, SearchOptions, SessionValidation};
use crate::error::AutomationError;

/// One automation instance, exclusively owned by a worker slot.
///
/// Methods take `&mut self`: an instance is never driven from two tasks at once.
#[async_trait]
pub trait Automation: Send {
    /// Prepare the instance for work (launch browser, open connection, ...).
    async fn initialize(&mut self) -> Result<(), AutomationError>;

    /// Run a keyword search under the given session.
    async fn search(
        &mut self,
        session: &AutomationSession,
        keywords: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<RawPost>, AutomationError>;

    /// Release everything the instance holds. Called once, when its slot goes away.
    async fn shutdown(&mut self) -> Result<(), AutomationError>;
}

/// Liveness and refresh checks for sessions, used by the lifecycle manager.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// Check that plaintext credentials still authenticate.
    async fn validate(
        &self,
        credentials: &[u8],
        user_agent: &str,
    ) -> Result<SessionValidation, AutomationError>;

    /// Extend a session's lifetime.
    async fn refresh(&self, session: &AutomationSession)
    -> Result<RefreshedSession, AutomationError>;
}

/// Produces a fresh, uninitialized automation instance for each worker slot.
pub type AutomationFactory = Arc<dyn Fn() -> Box<dyn Automation> + Send + Sync>;
