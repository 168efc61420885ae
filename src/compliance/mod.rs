// ABOUTME: Compliance module - rate windows, anomaly alerts and enforcement.
// ABOUTME: The governor is the single admission point for discovery requests.

mod alert;
mod governor;
mod window;

pub use alert::{AlertType, ComplianceAlert, EnforcementAction, Severity};
pub use governor::{AdmitDecision, Block, CompletionMeta, ComplianceGovernor, DenyReason, WindowUsage};
pub use window::{RateWindow, WindowKind};
