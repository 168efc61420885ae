// ABOUTME: Result cache keyed by search fingerprint.
// ABOUTME: Entries expire lazily on read; the oldest insertion is evicted under pressure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::automation::RawPost;
use crate::clock::{Clock, chrono_duration};
use crate::config::CacheConfig;

/// A cached, deduplicated result set.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub posts: Vec<RawPost>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    /// Expired once its age exceeds its ttl.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > chrono_duration(self.ttl)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    stats: CacheStats,
}

impl CacheState {
    fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        if let Some(pos) = self.order.iter().position(|f| f == fingerprint) {
            self.order.remove(pos);
        }
        Some(entry)
    }
}

/// Bounded FIFO cache of search results.
///
/// Reads that find an expired entry delete it under the same lock, so a
/// caller never sees an entry another caller is evicting.
pub struct ResultCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl ResultCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Look up a fingerprint. Expired entries count as a miss and are removed.
    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        match state.entries.get(fingerprint).map(|e| e.is_expired(now)) {
            None => {
                state.stats.misses += 1;
                return None;
            }
            Some(true) => {
                state.remove(fingerprint);
                state.stats.expirations += 1;
                state.stats.misses += 1;
                debug!(fingerprint, "cache entry expired");
                return None;
            }
            Some(false) => {}
        }

        state.stats.hits += 1;
        state.entries.get(fingerprint).cloned()
    }

    /// Store a result set with the configured ttl.
    pub fn put(&self, fingerprint: impl Into<String>, posts: Vec<RawPost>) {
        self.put_with_ttl(fingerprint, posts, self.config.ttl);
    }

    /// Store a result set. Replacing a fingerprint moves it to the back of
    /// the eviction order. A cache sized to zero stores nothing.
    pub fn put_with_ttl(&self, fingerprint: impl Into<String>, posts: Vec<RawPost>, ttl: Duration) {
        if self.config.max_entries == 0 {
            return;
        }
        let fingerprint = fingerprint.into();
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            posts,
            created_at: self.clock.now(),
            ttl,
        };

        let mut state = self.state.lock();
        state.remove(&fingerprint);
        while state.entries.len() >= self.config.max_entries {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            state.stats.evictions += 1;
            debug!(fingerprint = %oldest, "cache entry evicted");
        }
        state.order.push_back(fingerprint.clone());
        state.entries.insert(fingerprint, entry);
    }

    pub fn invalidate(&self, fingerprint: &str) -> bool {
        self.state.lock().remove(fingerprint).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }
}
