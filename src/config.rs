// ABOUTME: Configuration for every component, with defaults and env overrides.
// ABOUTME: TrawlConfig aggregates the per-component configs used by the service.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// A fixed-duration counting window and its admission limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    /// Maximum admitted requests per window.
    pub limit: u32,
    /// Length of the window.
    pub duration: Duration,
}

impl WindowLimit {
    pub const fn new(limit: u32, duration: Duration) -> Self {
        Self { limit, duration }
    }
}

/// Rate limits, anomaly thresholds and enforcement settings.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub burst: WindowLimit,
    pub minute: WindowLimit,
    pub hour: WindowLimit,
    pub day: WindowLimit,

    /// Global ceiling on in-flight admitted requests.
    pub max_concurrent: usize,

    /// Base for `recommended_delay`, before jitter and violation multiplier.
    pub base_delay: Duration,

    /// Capacity of the alert ring buffer.
    pub alert_buffer: usize,

    /// How far back the anomaly detector looks.
    pub anomaly_window: Duration,

    /// Minimum completions in the window before the failure rate is judged.
    pub min_failure_samples: usize,

    /// Failure rate above which an alert is raised.
    pub failure_rate_threshold: f64,

    /// Average latency above which an alert is raised.
    pub latency_threshold: Duration,

    /// Minimum completions before latency is judged.
    pub min_latency_samples: usize,

    /// How long a `pause` enforcement lasts.
    pub pause_duration: Duration,

    /// Case-insensitive phrases that mark a response as blocked.
    pub blocking_phrases: Vec<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            burst: WindowLimit::new(3, Duration::from_secs(10)),
            minute: WindowLimit::new(10, Duration::from_secs(60)),
            hour: WindowLimit::new(100, Duration::from_secs(3_600)),
            day: WindowLimit::new(500, Duration::from_secs(86_400)),
            max_concurrent: 10,
            base_delay: Duration::from_millis(2_000),
            alert_buffer: 1_000,
            anomaly_window: Duration::from_secs(300),
            min_failure_samples: 5,
            failure_rate_threshold: 0.5,
            latency_threshold: Duration::from_millis(10_000),
            min_latency_samples: 3,
            pause_duration: Duration::from_secs(900),
            blocking_phrases: [
                "captcha",
                "unusual activity",
                "temporarily restricted",
                "temporarily blocked",
                "verify you are human",
                "too many requests",
                "access denied",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl GovernorConfig {
    /// Set the burst window limit.
    pub fn burst(mut self, limit: u32, duration: Duration) -> Self {
        self.burst = WindowLimit::new(limit, duration);
        self
    }

    /// Set the minute window limit.
    pub fn per_minute(mut self, limit: u32) -> Self {
        self.minute.limit = limit;
        self
    }

    /// Set the hour window limit.
    pub fn per_hour(mut self, limit: u32) -> Self {
        self.hour.limit = limit;
        self
    }

    /// Set the day window limit.
    pub fn per_day(mut self, limit: u32) -> Self {
        self.day.limit = limit;
        self
    }

    /// Set the concurrency ceiling.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the base recommended delay.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the alert ring buffer capacity.
    pub fn alert_buffer(mut self, capacity: usize) -> Self {
        self.alert_buffer = capacity;
        self
    }
}

/// Health scoring, refresh and acquisition settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum health for a session to be acquired.
    pub min_health: f64,

    /// Remaining TTL below which a session is due for refresh.
    pub refresh_threshold: Duration,

    /// Idle time after which health is penalized.
    pub health_check_interval: Duration,

    /// TTL given to a session when the capability reports none.
    pub session_ttl: Duration,

    /// Period of the background refresh sweep.
    pub refresh_interval: Duration,

    /// Attempts per refresh before the session is expired.
    pub refresh_attempts: u32,

    /// Base of the exponential backoff between refresh attempts.
    pub refresh_backoff: Duration,

    /// Floor the health score is raised to on refresh.
    pub refreshed_health: f64,

    /// Health lost per failed outcome.
    pub failure_penalty: f64,

    /// Health gained per success, scaled by the success rate.
    pub success_step: f64,

    /// Minimum operation count used when estimating the failure rate.
    pub failure_estimate_floor: u32,

    /// Consecutive failures after which the session is marked Failed.
    pub max_consecutive_failures: u32,

    /// Fallback re-check period while waiting for a session.
    pub acquire_poll_interval: Duration,

    /// Upper bound on one validate or refresh call to the automation capability.
    pub probe_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_health: 0.5,
            refresh_threshold: Duration::from_secs(3_600),
            health_check_interval: Duration::from_secs(1_800),
            session_ttl: Duration::from_secs(86_400),
            refresh_interval: Duration::from_secs(300),
            refresh_attempts: 3,
            refresh_backoff: Duration::from_secs(1),
            refreshed_health: 0.9,
            failure_penalty: 0.1,
            success_step: 0.1,
            failure_estimate_floor: 10,
            max_consecutive_failures: 5,
            acquire_poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Set the minimum acquirable health.
    pub fn min_health(mut self, min: f64) -> Self {
        self.min_health = min.clamp(0.0, 1.0);
        self
    }

    /// Set the refresh threshold.
    pub fn refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    /// Set the default session TTL.
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Set refresh retry behavior.
    pub fn refresh_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.refresh_attempts = attempts.max(1);
        self.refresh_backoff = backoff;
        self
    }

    /// Set the consecutive failure cutoff.
    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Set the bound on a single validate or refresh call.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

/// Worker pool sizing and dispatch behavior.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Slots created at initialization.
    pub size: usize,

    /// How long dispatch waits for a free slot.
    pub acquire_timeout: Duration,

    /// Upper bound on a single automation call.
    pub task_timeout: Duration,

    /// Attempts made by `dispatch_with_retry`.
    pub max_attempts: u32,

    /// Base of the exponential backoff between attempts.
    pub retry_backoff: Duration,

    /// How long scale-down waits for in-flight work on a removed slot.
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(120),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Set the initial pool size.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the slot wait timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the per-task timeout.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set retry attempts and backoff base.
    pub fn retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }
}

/// Result cache bounds.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl: Duration::from_secs(3_600),
        }
    }
}

/// Duplicate detection thresholds.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Similarity at or above which a post is skipped as a duplicate.
    pub skip_similarity: f64,

    /// Similarity at or above which a post updates an existing record.
    pub update_similarity: f64,

    /// Allowed relative text length difference for fuzzy candidates.
    pub length_tolerance: f64,

    /// Maximum candidates fetched for the fuzzy strategy.
    pub candidate_limit: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            skip_similarity: 0.9,
            update_similarity: 0.7,
            length_tolerance: 0.5,
            candidate_limit: 50,
        }
    }
}

/// Settings for a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How long a run waits for a usable session.
    pub session_wait: Duration,

    /// Maximum posts requested from the automation capability.
    pub max_results: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            session_wait: Duration::from_secs(30),
            max_results: 50,
        }
    }
}

/// Complete configuration for the discovery core.
#[derive(Debug, Clone, Default)]
pub struct TrawlConfig {
    pub governor: GovernorConfig,
    pub sessions: SessionConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
    pub discovery: DiscoveryConfig,
}

impl TrawlConfig {
    /// Load configuration from `TRAWL_*` environment variables over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup over defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse::<u32>(&lookup, "TRAWL_BURST_LIMIT")? {
            config.governor.burst.limit = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "TRAWL_MINUTE_LIMIT")? {
            config.governor.minute.limit = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "TRAWL_HOUR_LIMIT")? {
            config.governor.hour.limit = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "TRAWL_DAY_LIMIT")? {
            config.governor.day.limit = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "TRAWL_MAX_CONCURRENT")? {
            config.governor.max_concurrent = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_BASE_DELAY_MS")? {
            config.governor.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse::<f64>(&lookup, "TRAWL_MIN_HEALTH")? {
            config.sessions.min_health = v.clamp(0.0, 1.0);
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_SESSION_TTL_SECS")? {
            config.sessions.session_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_PROBE_TIMEOUT_MS")? {
            config.sessions.probe_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_REFRESH_INTERVAL_SECS")? {
            config.sessions.refresh_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse::<usize>(&lookup, "TRAWL_POOL_SIZE")? {
            config.pool.size = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_WORKER_WAIT_MS")? {
            config.pool.acquire_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_TASK_TIMEOUT_MS")? {
            config.pool.task_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u32>(&lookup, "TRAWL_DISPATCH_ATTEMPTS")? {
            config.pool.max_attempts = v.max(1);
        }
        if let Some(v) = parse::<usize>(&lookup, "TRAWL_CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_CACHE_TTL_SECS")? {
            config.cache.ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "TRAWL_SESSION_WAIT_MS")? {
            config.discovery.session_wait = Duration::from_millis(v);
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = TrawlConfig::default();
        assert_eq!(config.governor.burst.limit, 3);
        assert_eq!(config.governor.burst.duration, Duration::from_secs(10));
        assert_eq!(config.sessions.min_health, 0.5);
        assert_eq!(config.dedup.skip_similarity, 0.9);
        assert_eq!(config.dedup.update_similarity, 0.7);
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("TRAWL_BURST_LIMIT", "2"),
            ("TRAWL_POOL_SIZE", "8"),
            ("TRAWL_MIN_HEALTH", "0.7"),
        ]
        .into_iter()
        .collect();

        let config =
            TrawlConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.governor.burst.limit, 2);
        assert_eq!(config.pool.size, 8);
        assert_eq!(config.sessions.min_health, 0.7);
        assert_eq!(config.governor.minute.limit, 10);
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let err = TrawlConfig::from_lookup(|k| {
            (k == "TRAWL_POOL_SIZE").then(|| "many".to_string())
        })
        .unwrap_err();

        match err {
            ConfigError::Invalid { key, value } => {
                assert_eq!(key, "TRAWL_POOL_SIZE");
                assert_eq!(value, "many");
            }
        }
    }
}
