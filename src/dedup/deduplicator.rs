// ABOUTME: ResultDeduplicator - result cache plus duplicate-aware lead persistence.
// ABOUTME: Runs the matching cascade within a batch, then against the lead store.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::cache::{CacheEntry, CacheStats, ResultCache};
use super::fingerprint::{jaccard_similarity, length_bounds, within_length};
use super::matcher::{DedupBatch, MatchStrategy, PreparedPost, Verdict, deduplicate_batch};
use crate::automation::RawPost;
use crate::clock::Clock;
use crate::config::{CacheConfig, DedupConfig};
use crate::error::StoreError;
use crate::scoring::{LeadCategory, LeadScore, score_post};
use crate::store::{Lead, LeadStore};

/// What persisting one post did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistAction {
    Created,
    Updated,
    Skipped,
}

/// Counts from one `persist` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistSummary {
    pub created: usize,
    pub updated: usize,
    /// Duplicates within the batch plus store matches that changed nothing.
    pub skipped: usize,
    pub errors: usize,
    /// The lead each surviving post landed on, in batch order.
    pub leads: Vec<Lead>,
}

impl PersistSummary {
    pub fn saved(&self) -> usize {
        self.created + self.updated
    }

    pub fn count(&self, category: LeadCategory) -> usize {
        self.leads.iter().filter(|l| l.category == category).count()
    }
}

/// Cache and duplicate detection for discovery results.
pub struct ResultDeduplicator {
    config: DedupConfig,
    cache: ResultCache,
    leads: Arc<dyn LeadStore>,
    clock: Arc<dyn Clock>,
}

impl ResultDeduplicator {
    pub fn new(
        config: DedupConfig,
        cache: CacheConfig,
        leads: Arc<dyn LeadStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            cache: ResultCache::new(cache, clock.clone()),
            leads,
            clock,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn get_cached(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.cache.get(fingerprint)
    }

    pub fn put_cached(&self, fingerprint: impl Into<String>, posts: Vec<RawPost>) {
        self.cache.put(fingerprint, posts);
    }

    pub fn put_cached_with_ttl(
        &self,
        fingerprint: impl Into<String>,
        posts: Vec<RawPost>,
        ttl: Duration,
    ) {
        self.cache.put_with_ttl(fingerprint, posts, ttl);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Remove duplicates within one batch. The result does not depend on
    /// input order, and deduplicating it again changes nothing.
    pub fn deduplicate(&self, posts: Vec<RawPost>) -> DedupBatch {
        deduplicate_batch(&self.config, posts)
    }

    /// Find the stored lead a post duplicates, if any.
    pub async fn match_stored(
        &self,
        agent_id: &str,
        prepared: &PreparedPost,
    ) -> Result<Option<(Lead, Verdict)>, StoreError> {
        if let Some(external_id) = prepared.post.external_id.as_deref() {
            let found = self
                .leads
                .find_lead_by_external_id(agent_id, external_id)
                .await?;
            if let Some(lead) = found {
                return Ok(Some((lead, Verdict::exact(MatchStrategy::ExternalId))));
            }
        }

        if let Some(url) = prepared.canonical_url.as_deref() {
            if let Some(lead) = self.leads.find_lead_by_url(agent_id, url).await? {
                return Ok(Some((lead, Verdict::exact(MatchStrategy::Url))));
            }
        }

        if let Some(lead) = self
            .leads
            .find_lead_by_content_hash(agent_id, &prepared.content_hash)
            .await?
        {
            return Ok(Some((lead, Verdict::exact(MatchStrategy::ContentHash))));
        }

        let text_len = prepared.text_len();
        let (min_len, max_len) = length_bounds(text_len, self.config.length_tolerance);
        let candidates = self
            .leads
            .find_similar_leads(
                agent_id,
                &prepared.post.author_handle,
                min_len,
                max_len,
                self.config.candidate_limit,
            )
            .await?;

        let best = candidates
            .into_iter()
            .filter(|lead| {
                within_length(
                    lead.text.chars().count(),
                    text_len,
                    self.config.length_tolerance,
                )
            })
            .map(|lead| {
                let similarity = jaccard_similarity(&prepared.post.text, &lead.text);
                (lead, similarity)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        Ok(best.and_then(|(lead, similarity)| {
            match Verdict::from_similarity(&self.config, similarity) {
                Verdict::New => None,
                verdict => Some((lead, verdict)),
            }
        }))
    }

    /// Deduplicate a batch and write it to the lead store.
    ///
    /// Each surviving post is matched against stored leads for the agent:
    /// exact or near-exact matches merge engagement into the existing lead,
    /// close variants refresh it with the newer extraction, the rest are
    /// created. Store failures are counted per post, never returned.
    pub async fn persist(
        &self,
        agent_id: &str,
        account_id: &str,
        posts: Vec<RawPost>,
        keywords: &[String],
    ) -> PersistSummary {
        let batch = self.deduplicate(posts);
        let mut summary = PersistSummary {
            skipped: batch.duplicates(),
            ..Default::default()
        };

        for post in batch.posts {
            let prepared = PreparedPost::new(post);
            match self
                .persist_one(agent_id, account_id, &prepared, keywords)
                .await
            {
                Ok((action, lead)) => {
                    match action {
                        PersistAction::Created => summary.created += 1,
                        PersistAction::Updated => summary.updated += 1,
                        PersistAction::Skipped => summary.skipped += 1,
                    }
                    summary.leads.push(lead);
                }
                Err(e) => {
                    warn!(agent_id, error = %e, "failed to persist lead");
                    summary.errors += 1;
                }
            }
        }

        info!(
            agent_id,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            errors = summary.errors,
            "leads persisted"
        );
        summary
    }

    async fn persist_one(
        &self,
        agent_id: &str,
        account_id: &str,
        prepared: &PreparedPost,
        keywords: &[String],
    ) -> Result<(PersistAction, Lead), StoreError> {
        let now = self.clock.now();

        if let Some((existing, verdict)) = self.match_stored(agent_id, prepared).await? {
            return self.merge(existing, verdict, prepared, keywords, now).await;
        }

        let score = score_post(&prepared.post, keywords, now);
        let lead = new_lead(agent_id, account_id, prepared, score, now);
        match self.leads.create_lead(&lead).await {
            Ok(()) => {
                debug!(agent_id, lead_id = %lead.id, category = %lead.category, "lead created");
                Ok((PersistAction::Created, lead))
            }
            // another run stored the same post between our lookup and insert
            Err(StoreError::Conflict { existing_id, .. }) => {
                let existing = self.leads.get_lead(&existing_id).await?.ok_or(
                    StoreError::NotFound {
                        kind: "lead",
                        id: existing_id,
                    },
                )?;
                debug!(agent_id, lead_id = %existing.id, "create raced, merging instead");
                self.merge(
                    existing,
                    Verdict::exact(MatchStrategy::ContentHash),
                    prepared,
                    keywords,
                    now,
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn merge(
        &self,
        mut lead: Lead,
        verdict: Verdict,
        prepared: &PreparedPost,
        keywords: &[String],
        now: DateTime<Utc>,
    ) -> Result<(PersistAction, Lead), StoreError> {
        let merged_metrics = lead.metrics.merge(&prepared.post.metrics);

        let action = match verdict {
            Verdict::Update { similarity } => {
                debug!(lead_id = %lead.id, similarity, "refreshing lead from close variant");
                self.adopt_keys(&mut lead, prepared).await?;
                lead.posted_at = prepared.post.posted_at.or(lead.posted_at);
                if prepared.post.author_name.is_some() {
                    lead.author_name = prepared.post.author_name.clone();
                }
                PersistAction::Updated
            }
            _ if merged_metrics != lead.metrics => PersistAction::Updated,
            _ => PersistAction::Skipped,
        };

        lead.metrics = merged_metrics;
        lead.last_seen_at = now;
        if action == PersistAction::Updated {
            let mut rescored = prepared.post.clone();
            rescored.text = lead.text.clone();
            rescored.posted_at = lead.posted_at;
            rescored.metrics = lead.metrics;
            apply_score(&mut lead, score_post(&rescored, keywords, now));
        }

        self.leads.update_lead(&lead).await?;
        Ok((action, lead))
    }

    /// Move a lead onto a close variant's text and fill its missing keys.
    ///
    /// A key already held by another lead stays where it is; the lead keeps
    /// its own value for it.
    async fn adopt_keys(&self, lead: &mut Lead, prepared: &PreparedPost) -> Result<(), StoreError> {
        let agent_id = lead.agent_id.clone();

        let holder = self
            .leads
            .find_lead_by_content_hash(&agent_id, &prepared.content_hash)
            .await?;
        if held_elsewhere(lead, holder) {
            debug!(lead_id = %lead.id, "variant text is stored as another lead, keeping text");
        } else {
            lead.text = prepared.post.text.clone();
            lead.content_hash = prepared.content_hash.clone();
        }

        if lead.external_id.is_none() {
            if let Some(external_id) = prepared.post.external_id.as_deref() {
                let holder = self
                    .leads
                    .find_lead_by_external_id(&agent_id, external_id)
                    .await?;
                if !held_elsewhere(lead, holder) {
                    lead.external_id = Some(external_id.to_string());
                }
            }
        }

        if lead.canonical_url.is_none() {
            if let Some(url) = prepared.canonical_url.as_deref() {
                let holder = self.leads.find_lead_by_url(&agent_id, url).await?;
                if !held_elsewhere(lead, holder) {
                    lead.canonical_url = Some(url.to_string());
                }
            }
        }
        Ok(())
    }
}

fn held_elsewhere(lead: &Lead, holder: Option<Lead>) -> bool {
    holder.is_some_and(|other| other.id != lead.id)
}

fn new_lead(
    agent_id: &str,
    account_id: &str,
    prepared: &PreparedPost,
    score: LeadScore,
    now: DateTime<Utc>,
) -> Lead {
    let post = &prepared.post;
    let mut lead = Lead {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        account_id: account_id.to_string(),
        external_id: post.external_id.clone(),
        canonical_url: prepared.canonical_url.clone(),
        content_hash: prepared.content_hash.clone(),
        author_handle: post.author_handle.clone(),
        author_name: post.author_name.clone(),
        text: post.text.clone(),
        posted_at: post.posted_at,
        metrics: post.metrics,
        score: 0.0,
        category: LeadCategory::Cold,
        matched_keywords: Vec::new(),
        first_seen_at: now,
        last_seen_at: now,
    };
    apply_score(&mut lead, score);
    lead
}

fn apply_score(lead: &mut Lead, score: LeadScore) {
    lead.score = score.score;
    lead.category = score.category;
    lead.matched_keywords = score.matched_keywords;
}
