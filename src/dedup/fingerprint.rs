// ABOUTME: Keys used for caching and duplicate detection.
// ABOUTME: Search fingerprints, canonical URLs, content hashes and token similarity.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::automation::{RawPost, SearchOptions};

/// Query parameters that never change what a URL points at.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content",
    "mc_cid", "mc_eid", "ref", "ref_src", "si", "igshid",
];

/// Cache key for a search: the normalized keyword set plus the options.
///
/// Keyword order, case, surrounding whitespace and repeats do not matter.
pub fn search_fingerprint(keywords: &[String], options: &SearchOptions) -> String {
    let mut normalized: Vec<String> = keywords
        .iter()
        .map(|k| k.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();

    let mut hasher = Sha256::new();
    for keyword in &normalized {
        hasher.update(keyword.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([0xff]);
    hasher.update(options.max_results.to_le_bytes());
    match options.since_hours {
        Some(hours) => {
            hasher.update([1u8]);
            hasher.update(hours.to_le_bytes());
        }
        None => hasher.update([0u8]),
    }
    match &options.language {
        Some(language) => {
            hasher.update([1u8]);
            hasher.update(language.to_lowercase().as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hex::encode(hasher.finalize())
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical form of a post URL, or None if it does not parse.
///
/// Drops the fragment and tracking parameters and trims a trailing slash.
/// The url crate already lowercases the scheme and host.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut parsed = url::Url::parse(raw.trim()).ok()?;
    parsed.set_fragment(None);

    if parsed.query().is_some() {
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.to_lowercase().as_str()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    Some(parsed.to_string())
}

/// Hash of author, normalized text and the UTC day the post was made.
pub fn content_hash(post: &RawPost) -> String {
    let day = post
        .posted_at
        .map(|at| at.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(post.author_handle.trim().to_lowercase().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_text(&post.text).as_bytes());
    hasher.update([0u8]);
    hasher.update(day.as_bytes());
    hex::encode(hasher.finalize())
}

/// Jaccard similarity over the word sets of two normalized texts.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_text(a);
    let b = normalize_text(b);
    let a_tokens: HashSet<&str> = a.split_whitespace().collect();
    let b_tokens: HashSet<&str> = b.split_whitespace().collect();
    let union = a_tokens.union(&b_tokens).count();
    if union == 0 {
        return 0.0;
    }
    a_tokens.intersection(&b_tokens).count() as f64 / union as f64
}

/// Whether two text lengths differ by at most `tolerance` of the longer one.
pub(crate) fn within_length(a: usize, b: usize, tolerance: f64) -> bool {
    let longer = a.max(b) as f64;
    (a.abs_diff(b) as f64) <= tolerance * longer
}

/// Inclusive length range whose members are `within_length` of `len`.
pub(crate) fn length_bounds(len: usize, tolerance: f64) -> (usize, usize) {
    let tolerance = tolerance.clamp(0.0, 1.0);
    let min = (len as f64 * (1.0 - tolerance)).ceil() as usize;
    let max = if tolerance >= 1.0 {
        usize::MAX
    } else {
        (len as f64 / (1.0 - tolerance)).floor() as usize
    };
    (min, max)
}
