// ABOUTME: Duplicate matching cascade shared by batch and store deduplication.
// ABOUTME: External id, canonical URL, content hash, then same-author text similarity.

use std::cmp::Ordering;

use crate::automation::RawPost;
use crate::config::DedupConfig;

use super::fingerprint::{canonical_url, content_hash, jaccard_similarity, within_length};

/// Which step of the cascade matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStrategy {
    ExternalId,
    Url,
    ContentHash,
    Similarity,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStrategy::ExternalId => "external_id",
            MatchStrategy::Url => "url",
            MatchStrategy::ContentHash => "content_hash",
            MatchStrategy::Similarity => "similarity",
        }
    }
}

/// Outcome of matching one post against what is already known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    New,
    /// Same post; nothing new beyond engagement counts.
    Skip { strategy: MatchStrategy, similarity: f64 },
    /// Close enough to be the same post, different enough to refresh it.
    Update { similarity: f64 },
}

impl Verdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Verdict::New)
    }

    pub(crate) fn exact(strategy: MatchStrategy) -> Self {
        Verdict::Skip {
            strategy,
            similarity: 1.0,
        }
    }

    /// Map a similarity score onto the skip/update thresholds.
    pub(crate) fn from_similarity(config: &DedupConfig, similarity: f64) -> Self {
        if similarity >= config.skip_similarity {
            Verdict::Skip {
                strategy: MatchStrategy::Similarity,
                similarity,
            }
        } else if similarity >= config.update_similarity {
            Verdict::Update { similarity }
        } else {
            Verdict::New
        }
    }
}

/// A post with its derived match keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedPost {
    pub post: RawPost,
    pub canonical_url: Option<String>,
    pub content_hash: String,
}

impl PreparedPost {
    pub fn new(post: RawPost) -> Self {
        let canonical_url = post.url.as_deref().and_then(canonical_url);
        let content_hash = content_hash(&post);
        Self {
            post,
            canonical_url,
            content_hash,
        }
    }

    pub(crate) fn text_len(&self) -> usize {
        self.post.text.chars().count()
    }

    /// Exact-key step of the cascade against another prepared post.
    pub(crate) fn exact_match(&self, other: &PreparedPost) -> Option<MatchStrategy> {
        if self.post.external_id.is_some() && self.post.external_id == other.post.external_id {
            return Some(MatchStrategy::ExternalId);
        }
        if self.canonical_url.is_some() && self.canonical_url == other.canonical_url {
            return Some(MatchStrategy::Url);
        }
        if self.content_hash == other.content_hash {
            return Some(MatchStrategy::ContentHash);
        }
        None
    }

    /// Whether `other` is a fuzzy-match candidate: same author, similar length.
    pub(crate) fn is_candidate(&self, author: &str, text_len: usize, tolerance: f64) -> bool {
        self.post.author_handle.eq_ignore_ascii_case(author)
            && within_length(self.text_len(), text_len, tolerance)
    }

    /// Total order used to make batch results independent of input order.
    fn canonical_cmp(&self, other: &PreparedPost) -> Ordering {
        self.post
            .posted_at
            .cmp(&other.post.posted_at)
            .then_with(|| self.post.external_id.cmp(&other.post.external_id))
            .then_with(|| self.canonical_url.cmp(&other.canonical_url))
            .then_with(|| self.content_hash.cmp(&other.content_hash))
    }
}

/// Result of deduplicating one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupBatch {
    /// Surviving posts in canonical order.
    pub posts: Vec<RawPost>,
    /// Dropped as exact or near-exact duplicates.
    pub skipped: usize,
    /// Folded into a kept post as a close variant.
    pub merged: usize,
}

impl DedupBatch {
    pub fn duplicates(&self) -> usize {
        self.skipped + self.merged
    }
}

/// Run the cascade over a batch, keeping the first post of every duplicate
/// group in canonical order. Duplicates contribute their engagement to the
/// kept post; its text is never changed, so a second pass keeps everything.
pub(crate) fn deduplicate_batch(config: &DedupConfig, posts: Vec<RawPost>) -> DedupBatch {
    let mut prepared: Vec<PreparedPost> = posts.into_iter().map(PreparedPost::new).collect();
    prepared.sort_by(|a, b| a.canonical_cmp(b));

    let mut kept: Vec<PreparedPost> = Vec::with_capacity(prepared.len());
    let mut batch = DedupBatch::default();

    for post in prepared {
        let (verdict, target) = match_against(config, &post, &kept);
        match (verdict, target) {
            (Verdict::New, _) | (_, None) => kept.push(post),
            (verdict, Some(index)) => {
                let existing = &mut kept[index];
                existing.post.metrics = existing.post.metrics.merge(&post.post.metrics);
                match verdict {
                    Verdict::Update { .. } => batch.merged += 1,
                    _ => batch.skipped += 1,
                }
            }
        }
    }

    batch.posts = kept.into_iter().map(|p| p.post).collect();
    batch
}

/// First exact match wins; otherwise the most similar same-author candidate.
fn match_against(
    config: &DedupConfig,
    post: &PreparedPost,
    kept: &[PreparedPost],
) -> (Verdict, Option<usize>) {
    for strategy in [
        MatchStrategy::ExternalId,
        MatchStrategy::Url,
        MatchStrategy::ContentHash,
    ] {
        if let Some(index) = kept
            .iter()
            .position(|k| post.exact_match(k) == Some(strategy))
        {
            return (Verdict::exact(strategy), Some(index));
        }
    }

    let text_len = post.text_len();
    let best = kept
        .iter()
        .enumerate()
        .filter(|(_, k)| k.is_candidate(&post.post.author_handle, text_len, config.length_tolerance))
        .map(|(i, k)| (i, jaccard_similarity(&post.post.text, &k.post.text)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

    match best {
        Some((index, similarity)) => match Verdict::from_similarity(config, similarity) {
            Verdict::New => (Verdict::New, None),
            verdict => (verdict, Some(index)),
        },
        None => (Verdict::New, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_thresholds() {
        let config = DedupConfig::default();
        assert!(matches!(
            Verdict::from_similarity(&config, 0.95),
            Verdict::Skip {
                strategy: MatchStrategy::Similarity,
                ..
            }
        ));
        assert!(matches!(
            Verdict::from_similarity(&config, 0.7),
            Verdict::Update { .. }
        ));
        assert_eq!(Verdict::from_similarity(&config, 0.69), Verdict::New);
    }

    #[test]
    fn test_exact_match_order() {
        let a = PreparedPost::new(
            RawPost::new("jane", "one")
                .external_id("x1")
                .url("https://social.example/p/1"),
        );
        let b = PreparedPost::new(
            RawPost::new("jane", "two")
                .external_id("x1")
                .url("https://social.example/p/1"),
        );
        assert_eq!(a.exact_match(&b), Some(MatchStrategy::ExternalId));

        let c = PreparedPost::new(RawPost::new("jane", "three").url("https://social.example/p/1/"));
        assert_eq!(a.exact_match(&c), Some(MatchStrategy::Url));

        let d = PreparedPost::new(RawPost::new("JANE", "One!"));
        assert_eq!(a.exact_match(&d), Some(MatchStrategy::ContentHash));

        let e = PreparedPost::new(RawPost::new("bob", "one"));
        assert_eq!(a.exact_match(&e), None);
    }
}
