// ABOUTME: Session module - authenticated automation identities and their lifecycle.
// ABOUTME: Health scoring, acquisition, blacklisting and background refresh.

mod manager;
mod types;

pub use manager::{RefreshLoopHandle, SessionLifecycleManager};
pub use types::{HealthReport, RefreshReport, Session, SessionStats, SessionStatus};

#[cfg(test)]
mod manager_test;
