// ABOUTME: Simulated automation variant - generates posts without a browser.
// ABOUTME: Scriptable outcomes and counters make pool and service behavior testable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{
    Automation, AutomationFactory, AutomationSession, RawPost, RefreshedSession, SearchOptions,
    SessionProbe, SessionValidation,
};
use crate::error::AutomationError;

/// A scripted result for the next search served by any simulated instance.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Return exactly these posts.
    Posts(Vec<RawPost>),
    /// Fail with a retryable error.
    Transient(String),
    /// Fail because the target rejected the session.
    SessionInvalid(String),
    /// Fail because the target is blocking us; the message is the response body.
    Blocked(String),
    /// Never return (until the caller's timeout fires).
    Hang,
}

impl ScriptedOutcome {
    fn into_result(self) -> Result<Vec<RawPost>, AutomationError> {
        match self {
            ScriptedOutcome::Posts(posts) => Ok(posts),
            ScriptedOutcome::Transient(msg) => Err(AutomationError::Transient(msg)),
            ScriptedOutcome::SessionInvalid(msg) => Err(AutomationError::SessionInvalid(msg)),
            ScriptedOutcome::Blocked(msg) => Err(AutomationError::Blocked(msg)),
            ScriptedOutcome::Hang => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Default)]
struct SimulationState {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    fixed_posts: Mutex<Option<Vec<RawPost>>>,
    latency: Mutex<Duration>,
    posts_per_search: AtomicUsize,
    init_failures: AtomicUsize,
    validation_failures: AtomicUsize,
    refresh_failures: AtomicUsize,
    created: AtomicUsize,
    searches: AtomicUsize,
    shutdowns: AtomicUsize,
    refreshes: AtomicUsize,
}

/// Shared controller for all simulated instances produced by its factory.
#[derive(Debug, Clone)]
pub struct Simulation {
    state: Arc<SimulationState>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    /// Create a simulation that returns five generated posts per search.
    pub fn new() -> Self {
        let state = SimulationState::default();
        state.posts_per_search.store(5, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    /// Factory producing simulated instances bound to this controller.
    pub fn factory(&self) -> AutomationFactory {
        let sim = self.clone();
        Arc::new(move || {
            let id = sim.state.created.fetch_add(1, Ordering::SeqCst);
            Box::new(SimulatedAutomation {
                id,
                sim: sim.clone(),
                initialized: false,
                shut_down: false,
            }) as Box<dyn Automation>
        })
    }

    /// Queue an outcome for the next search.
    pub fn push_outcome(&self, outcome: ScriptedOutcome) {
        self.state.script.lock().push_back(outcome);
    }

    /// Return these posts from every unscripted search.
    pub fn set_posts(&self, posts: Vec<RawPost>) {
        *self.state.fixed_posts.lock() = Some(posts);
    }

    /// Number of generated posts per unscripted search.
    pub fn set_posts_per_search(&self, count: usize) {
        self.state.posts_per_search.store(count, Ordering::SeqCst);
    }

    /// Simulated time spent in each search.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Make the next `count` instance initializations fail.
    pub fn fail_initializations(&self, count: usize) {
        self.state.init_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` validations fail.
    pub fn fail_validations(&self, count: usize) {
        self.state.validation_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` refreshes fail.
    pub fn fail_refreshes(&self, count: usize) {
        self.state.refresh_failures.store(count, Ordering::SeqCst);
    }

    /// Instances created so far.
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Searches served so far.
    pub fn searches(&self) -> usize {
        self.state.searches.load(Ordering::SeqCst)
    }

    /// Instances shut down so far.
    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    /// Refresh attempts served so far.
    pub fn refreshes(&self) -> usize {
        self.state.refreshes.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn generate(&self, keywords: &[String], options: &SearchOptions) -> Vec<RawPost> {
        if let Some(posts) = self.state.fixed_posts.lock().clone() {
            return posts;
        }

        let count = self
            .state
            .posts_per_search
            .load(Ordering::SeqCst)
            .min(options.max_results);
        let topic = keywords.join(" ");
        let slug = keywords.join("-").to_lowercase();
        let now = Utc::now();

        (0..count)
            .map(|i| {
                RawPost::new(
                    format!("author{}", i),
                    format!("Looking for help with {} this week, post number {}", topic, i),
                )
                .external_id(format!("sim-{}-{}", slug, i))
                .url(format!("https://social.example/posts/sim-{}-{}", slug, i))
                .posted_at(now - chrono::Duration::hours(i as i64))
                .metrics(10 * i as u64, i as u64, 0)
            })
            .collect()
    }
}

#[async_trait]
impl SessionProbe for Simulation {
    async fn validate(
        &self,
        credentials: &[u8],
        _user_agent: &str,
    ) -> Result<SessionValidation, AutomationError> {
        if credentials.is_empty() {
            return Err(AutomationError::SessionInvalid("empty credentials".into()));
        }
        if Self::take_failure(&self.state.validation_failures) {
            return Err(AutomationError::SessionInvalid(
                "login wall shown during validation".into(),
            ));
        }
        Ok(SessionValidation::default())
    }

    async fn refresh(
        &self,
        _session: &AutomationSession,
    ) -> Result<RefreshedSession, AutomationError> {
        self.state.refreshes.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.state.refresh_failures) {
            return Err(AutomationError::Transient("refresh did not complete".into()));
        }
        Ok(RefreshedSession::default())
    }
}

/// A simulated automation instance.
#[derive(Debug)]
pub struct SimulatedAutomation {
    id: usize,
    sim: Simulation,
    initialized: bool,
    shut_down: bool,
}

impl SimulatedAutomation {
    /// Sequence number of this instance within its simulation.
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl Automation for SimulatedAutomation {
    async fn initialize(&mut self) -> Result<(), AutomationError> {
        if Simulation::take_failure(&self.sim.state.init_failures) {
            return Err(AutomationError::Transient(format!(
                "simulated instance {} failed to launch",
                self.id
            )));
        }
        self.initialized = true;
        Ok(())
    }

    async fn search(
        &mut self,
        _session: &AutomationSession,
        keywords: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<RawPost>, AutomationError> {
        if self.shut_down || !self.initialized {
            return Err(AutomationError::ShutDown);
        }

        self.sim.state.searches.fetch_add(1, Ordering::SeqCst);

        let latency = *self.sim.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.sim.state.script.lock().pop_front();
        match scripted {
            Some(ScriptedOutcome::Hang) => {
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
            Some(outcome) => outcome.into_result(),
            None => Ok(self.sim.generate(keywords, options)),
        }
    }

    async fn shutdown(&mut self) -> Result<(), AutomationError> {
        if !self.shut_down {
            self.shut_down = true;
            self.sim.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
