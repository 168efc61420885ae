// ABOUTME: Hook system for observing discovery, session, pool and compliance events.
// ABOUTME: Provides events, a Hook trait, and a registry with closure helpers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::compliance::ComplianceAlert;
use crate::discovery::DiscoveryReport;

/// Events that can trigger hooks.
#[derive(Debug, Clone)]
pub enum HookEvent {
    /// A discovery run was accepted and is starting.
    RunStarted {
        run_id: String,
        agent_id: String,
        keywords: Vec<String>,
    },

    /// A discovery run finished, successfully or not.
    RunCompleted {
        run_id: String,
        agent_id: String,
        /// Present when the run produced a report.
        report: Option<DiscoveryReport>,
        /// Error message if the run failed outright.
        error: Option<String>,
    },

    /// The compliance governor raised an alert.
    AlertRaised { alert: ComplianceAlert },

    /// A session was blacklisted.
    SessionBlacklisted { session_id: String, reason: String },

    /// A session expired, from lifetime end or exhausted refresh.
    SessionExpired { session_id: String, reason: String },

    /// A worker slot finished a task with an error.
    SlotErrored { slot_id: usize, error: String },
}

impl HookEvent {
    /// Short event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::RunStarted { .. } => "RunStarted",
            HookEvent::RunCompleted { .. } => "RunCompleted",
            HookEvent::AlertRaised { .. } => "AlertRaised",
            HookEvent::SessionBlacklisted { .. } => "SessionBlacklisted",
            HookEvent::SessionExpired { .. } => "SessionExpired",
            HookEvent::SlotErrored { .. } => "SlotErrored",
        }
    }
}

/// Trait for implementing hooks.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Called when an event occurs. Errors are logged and otherwise ignored.
    async fn on_event(&self, event: &HookEvent) -> Result<(), anyhow::Error>;

    /// Optional: Filter which events this hook cares about.
    /// Default returns true for all events.
    fn accepts(&self, event: &HookEvent) -> bool {
        let _ = event;
        true
    }
}

/// Registry for managing and firing hooks.
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
}

impl HookRegistry {
    /// Create a new empty hook registry.
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Create a new registry wrapped in Arc for sharing between components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a hook.
    pub async fn register(&self, hook: impl Hook + 'static) {
        self.hooks.write().await.push(Arc::new(hook));
    }

    /// Register a hook wrapped in Arc.
    pub async fn register_arc(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().await.push(hook);
    }

    /// Fire an event to all registered hooks.
    ///
    /// Hooks observe; they cannot fail the operation that fired the event.
    pub async fn fire(&self, event: &HookEvent) {
        let hooks = self.hooks.read().await;
        for hook in hooks.iter() {
            if !hook.accepts(event) {
                continue;
            }
            if let Err(e) = hook.on_event(event).await {
                warn!(event = event.name(), error = %e, "hook failed");
            }
        }
    }

    /// Get the number of registered hooks.
    pub async fn len(&self) -> usize {
        self.hooks.read().await.len()
    }

    /// Check if the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.hooks.read().await.is_empty()
    }

    /// Register a hook that only handles AlertRaised events.
    pub async fn on_alert<F>(&self, f: F)
    where
        F: Fn(&ComplianceAlert) + Send + Sync + 'static,
    {
        self.register(AlertHook { callback: f }).await;
    }

    /// Register a hook that only handles SessionExpired and SessionBlacklisted events.
    ///
    /// The callback receives (session_id, reason).
    pub async fn on_session_retired<F>(&self, f: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.register(SessionRetiredHook { callback: f }).await;
    }

    /// Register a hook that only handles RunCompleted events.
    ///
    /// The callback receives (agent_id, report, error).
    pub async fn on_run_completed<F>(&self, f: F)
    where
        F: Fn(&str, Option<&DiscoveryReport>, Option<&str>) + Send + Sync + 'static,
    {
        self.register(RunCompletedHook { callback: f }).await;
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire on an optional registry.
pub(crate) async fn fire_opt(hooks: &Option<Arc<HookRegistry>>, event: HookEvent) {
    if let Some(hooks) = hooks {
        hooks.fire(&event).await;
    }
}

/// Hook wrapper for AlertRaised events.
struct AlertHook<F> {
    callback: F,
}

#[async_trait]
impl<F> Hook for AlertHook<F>
where
    F: Fn(&ComplianceAlert) + Send + Sync,
{
    fn accepts(&self, event: &HookEvent) -> bool {
        matches!(event, HookEvent::AlertRaised { .. })
    }

    async fn on_event(&self, event: &HookEvent) -> Result<(), anyhow::Error> {
        if let HookEvent::AlertRaised { alert } = event {
            (self.callback)(alert);
        }
        Ok(())
    }
}

/// Hook wrapper for session retirement events.
struct SessionRetiredHook<F> {
    callback: F,
}

#[async_trait]
impl<F> Hook for SessionRetiredHook<F>
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn accepts(&self, event: &HookEvent) -> bool {
        matches!(
            event,
            HookEvent::SessionExpired { .. } | HookEvent::SessionBlacklisted { .. }
        )
    }

    async fn on_event(&self, event: &HookEvent) -> Result<(), anyhow::Error> {
        match event {
            HookEvent::SessionExpired { session_id, reason }
            | HookEvent::SessionBlacklisted { session_id, reason } => {
                (self.callback)(session_id, reason);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Hook wrapper for RunCompleted events.
struct RunCompletedHook<F> {
    callback: F,
}

#[async_trait]
impl<F> Hook for RunCompletedHook<F>
where
    F: Fn(&str, Option<&DiscoveryReport>, Option<&str>) + Send + Sync,
{
    fn accepts(&self, event: &HookEvent) -> bool {
        matches!(event, HookEvent::RunCompleted { .. })
    }

    async fn on_event(&self, event: &HookEvent) -> Result<(), anyhow::Error> {
        if let HookEvent::RunCompleted {
            agent_id,
            report,
            error,
            ..
        } = event
        {
            (self.callback)(agent_id, report.as_ref(), error.as_deref());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingHook {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Hook for CountingHook {
        async fn on_event(&self, _event: &HookEvent) -> Result<(), anyhow::Error> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl Hook for FailingHook {
        async fn on_event(&self, _event: &HookEvent) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("sink offline"))
        }
    }

    fn expired() -> HookEvent {
        HookEvent::SessionExpired {
            session_id: "s-1".into(),
            reason: "refresh exhausted".into(),
        }
    }

    #[tokio::test]
    async fn test_fire_reaches_all_hooks() {
        let registry = HookRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .register(CountingHook {
                count: count.clone(),
            })
            .await;
        registry
            .register(CountingHook {
                count: count.clone(),
            })
            .await;

        registry.fire(&expired()).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_others() {
        let registry = HookRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.register(FailingHook).await;
        registry
            .register(CountingHook {
                count: count.clone(),
            })
            .await;

        registry.fire(&expired()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_retired_helper_filters_events() {
        let registry = HookRegistry::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry
            .on_session_retired(move |id, reason| {
                sink.lock().push(format!("{}:{}", id, reason));
            })
            .await;

        registry.fire(&expired()).await;
        registry
            .fire(&HookEvent::SlotErrored {
                slot_id: 1,
                error: "boom".into(),
            })
            .await;

        assert_eq!(*seen.lock(), vec!["s-1:refresh exhausted".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let registry = HookRegistry::default();
        assert!(registry.is_empty().await);
        registry.fire(&expired()).await;
    }
}
