// ABOUTME: Root module for trawl - discovery orchestration core.
// ABOUTME: Re-exports all public types from submodules.

pub mod automation;
pub mod cipher;
pub mod clock;
pub mod compliance;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod hook;
pub mod pool;
pub mod prelude;
pub mod scoring;
pub mod session;
pub mod store;

pub use error::TrawlError;
