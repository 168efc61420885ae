// ABOUTME: Discovery module - the caller-facing run_discovery operation.
// ABOUTME: Wires governor, sessions, pool and deduplicator into one run.

mod service;
mod types;

pub use service::DiscoveryService;
pub use types::{DiscoveryReport, DiscoveryRequest, Priority};

#[cfg(test)]
mod service_test;
