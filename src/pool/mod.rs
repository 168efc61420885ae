// ABOUTME: Worker pool module - bounded concurrency over automation instances.
// ABOUTME: Contains the pool, its slots, and scaling and dispatch logic.

mod pool;
mod slot;

pub use pool::{PoolStats, WorkerPool};
pub use slot::{SlotSnapshot, SlotStatus};
