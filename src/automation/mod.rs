// ABOUTME: Automation capability module - the external browser-automation seam.
// ABOUTME: One trait, two variants (HTTP service, simulation) chosen via factory.

mod http;
mod simulated;
mod traits;
mod types;

use std::sync::Arc;

pub use http::{HttpAutomation, HttpAutomationConfig};
pub use simulated::{ScriptedOutcome, SimulatedAutomation, Simulation};
pub use traits::{Automation, AutomationFactory, SessionProbe};
pub use types::{
    AutomationSession, EngagementMetrics, RawPost, RefreshedSession, SearchOptions,
    SessionValidation,
};

/// Which automation implementation backs the pool and session checks.
#[derive(Debug, Clone)]
pub enum AutomationKind {
    /// A remote browser-automation service.
    Http(HttpAutomationConfig),
    /// In-process simulation.
    Simulated(Simulation),
}

impl AutomationKind {
    /// Factory for worker slot instances.
    pub fn factory(&self) -> AutomationFactory {
        match self {
            AutomationKind::Http(config) => config.factory(),
            AutomationKind::Simulated(sim) => sim.factory(),
        }
    }

    /// Probe used by the session lifecycle manager.
    pub fn probe(&self) -> Arc<dyn SessionProbe> {
        match self {
            AutomationKind::Http(config) => Arc::new(HttpAutomation::new(config.clone())),
            AutomationKind::Simulated(sim) => Arc::new(sim.clone()),
        }
    }
}
