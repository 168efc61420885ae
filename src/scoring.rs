// ABOUTME: Lead scoring - weighs keyword relevance, engagement and recency into [0,1].
// ABOUTME: Buckets scores into hot/medium/cold categories for the discovery report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::RawPost;

const RELEVANCE_WEIGHT: f64 = 0.5;
const ENGAGEMENT_WEIGHT: f64 = 0.3;
const RECENCY_WEIGHT: f64 = 0.2;

/// Weighted interactions at which engagement saturates.
const ENGAGEMENT_SATURATION: f64 = 1_000.0;

/// Age at which recency reaches zero.
const RECENCY_HORIZON_HOURS: f64 = 7.0 * 24.0;

pub const HOT_THRESHOLD: f64 = 0.7;
pub const MEDIUM_THRESHOLD: f64 = 0.4;

/// Lead temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadCategory {
    Hot,
    Medium,
    Cold,
}

impl LeadCategory {
    pub fn from_score(score: f64) -> Self {
        if score >= HOT_THRESHOLD {
            LeadCategory::Hot
        } else if score >= MEDIUM_THRESHOLD {
            LeadCategory::Medium
        } else {
            LeadCategory::Cold
        }
    }
}

impl std::fmt::Display for LeadCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadCategory::Hot => write!(f, "hot"),
            LeadCategory::Medium => write!(f, "medium"),
            LeadCategory::Cold => write!(f, "cold"),
        }
    }
}

/// A post's score and the keywords that contributed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadScore {
    pub score: f64,
    pub category: LeadCategory,
    pub matched_keywords: Vec<String>,
}

/// Score a post against the keywords it was found with.
pub fn score_post(post: &RawPost, keywords: &[String], now: DateTime<Utc>) -> LeadScore {
    let text = post.text.to_lowercase();
    let matched_keywords: Vec<String> = keywords
        .iter()
        .filter(|k| {
            let k = k.trim().to_lowercase();
            !k.is_empty() && text.contains(&k)
        })
        .cloned()
        .collect();

    let relevance = if keywords.is_empty() {
        0.0
    } else {
        matched_keywords.len() as f64 / keywords.len() as f64
    };

    // log scale so one viral post does not flatten everything else
    let interactions = post.metrics.weighted_total() as f64;
    let engagement = ((1.0 + interactions).ln() / (1.0 + ENGAGEMENT_SATURATION).ln()).min(1.0);

    let recency = match post.posted_at {
        Some(at) => {
            let age_hours = (now - at).num_minutes().max(0) as f64 / 60.0;
            (1.0 - age_hours / RECENCY_HORIZON_HOURS).max(0.0)
        }
        None => 0.0,
    };

    let score = (RELEVANCE_WEIGHT * relevance
        + ENGAGEMENT_WEIGHT * engagement
        + RECENCY_WEIGHT * recency)
        .clamp(0.0, 1.0);

    LeadScore {
        score,
        category: LeadCategory::from_score(score),
        matched_keywords,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords() -> Vec<String> {
        vec!["plumber".to_string(), "leak".to_string()]
    }

    #[test]
    fn test_fresh_relevant_engaged_post_is_hot() {
        let now = Utc::now();
        let post = RawPost::new("ana", "Need a plumber ASAP, kitchen leak everywhere")
            .posted_at(now)
            .metrics(400, 100, 50);

        let scored = score_post(&post, &keywords(), now);
        assert_eq!(scored.category, LeadCategory::Hot);
        assert_eq!(scored.matched_keywords, keywords());
    }

    #[test]
    fn test_irrelevant_stale_post_is_cold() {
        let now = Utc::now();
        let post = RawPost::new("bo", "Lovely weather today")
            .posted_at(now - chrono::Duration::days(30));

        let scored = score_post(&post, &keywords(), now);
        assert_eq!(scored.score, 0.0);
        assert_eq!(scored.category, LeadCategory::Cold);
    }

    #[test]
    fn test_relevant_but_quiet_post_is_medium() {
        let now = Utc::now();
        let post = RawPost::new("cy", "anyone know a good plumber").posted_at(now);

        // 0.5 * 0.5 relevance + 0.2 recency
        let scored = score_post(&post, &keywords(), now);
        assert!((scored.score - 0.45).abs() < 1e-9);
        assert_eq!(scored.category, LeadCategory::Medium);
    }

    #[test]
    fn test_category_thresholds() {
        assert_eq!(LeadCategory::from_score(0.7), LeadCategory::Hot);
        assert_eq!(LeadCategory::from_score(0.69), LeadCategory::Medium);
        assert_eq!(LeadCategory::from_score(0.4), LeadCategory::Medium);
        assert_eq!(LeadCategory::from_score(0.39), LeadCategory::Cold);
    }
}
