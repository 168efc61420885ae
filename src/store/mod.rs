// ABOUTME: Store module - persistence contracts and the in-memory backend.
// ABOUTME: The core depends only on the traits; engines plug in behind them.

mod memory;
mod traits;
mod types;

pub use memory::MemoryStore;
pub use traits::{DirectoryStore, LeadStore, SessionStore};
pub use types::{Account, Agent, Lead};
