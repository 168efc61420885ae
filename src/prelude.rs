// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use trawl::prelude::*;` to get started quickly.

pub use crate::automation::{
    Automation, AutomationFactory, AutomationKind, AutomationSession, EngagementMetrics,
    HttpAutomationConfig, RawPost, ScriptedOutcome, SearchOptions, SessionProbe, Simulation,
};
pub use crate::cipher::{Cipher, PlaintextCipher};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::compliance::{
    AlertType, Block, ComplianceAlert, ComplianceGovernor, CompletionMeta, EnforcementAction,
    Severity,
};
pub use crate::config::{
    CacheConfig, DedupConfig, DiscoveryConfig, GovernorConfig, PoolConfig, SessionConfig,
    TrawlConfig,
};
pub use crate::dedup::{PersistSummary, ResultDeduplicator, Verdict, search_fingerprint};
pub use crate::discovery::{DiscoveryReport, DiscoveryRequest, DiscoveryService, Priority};
pub use crate::error::{
    AutomationError, ConfigError, DiscoveryError, PoolError, SessionError, StoreError, TrawlError,
};
pub use crate::hook::{Hook, HookEvent, HookRegistry};
pub use crate::pool::{PoolStats, WorkerPool};
pub use crate::scoring::{LeadCategory, LeadScore, score_post};
pub use crate::session::{Session, SessionLifecycleManager, SessionStatus};
pub use crate::store::{Account, Agent, DirectoryStore, Lead, LeadStore, MemoryStore, SessionStore};
