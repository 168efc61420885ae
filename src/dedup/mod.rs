// ABOUTME: Deduplication module - result cache, matching cascade and lead persistence.
// ABOUTME: Keeps repeated searches cheap and the lead store free of duplicates.

mod cache;
mod deduplicator;
mod fingerprint;
mod matcher;

pub use cache::{CacheEntry, CacheStats, ResultCache};
pub use deduplicator::{PersistAction, PersistSummary, ResultDeduplicator};
pub use fingerprint::{
    canonical_url, content_hash, jaccard_similarity, normalize_text, search_fingerprint,
};
pub use matcher::{DedupBatch, MatchStrategy, PreparedPost, Verdict};
