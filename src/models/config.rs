//! Application configuration structures.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Query;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Monitoring behavior settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Retry and backoff tuning
    #[serde(default)]
    pub retry: RetryConfig,

    /// Response cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Notification channel settings
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Configured search queries
    #[serde(default)]
    pub queries: Vec<Query>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.max_concurrent == 0 {
            return Err(AppError::validation("monitor.max_concurrent must be > 0"));
        }
        if self.monitor.lookback_days == 0 {
            return Err(AppError::validation("monitor.lookback_days must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.monitor.failure_threshold) {
            return Err(AppError::validation(
                "monitor.failure_threshold must be between 0.0 and 1.0",
            ));
        }
        if self.monitor.timeout_secs == 0 {
            return Err(AppError::validation("monitor.timeout_secs must be > 0"));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(AppError::validation("retry.backoff_factor must be >= 1.0"));
        }
        if self.cache.enabled {
            if self.cache.ttl_minutes <= 0 {
                return Err(AppError::validation("cache.ttl_minutes must be > 0"));
            }
            if self.cache.max_entries == 0 {
                return Err(AppError::validation("cache.max_entries must be > 0"));
            }
        }
        if self.queries.is_empty() {
            return Err(AppError::validation("No queries defined"));
        }

        let mut seen = std::collections::HashSet::new();
        for query in &self.queries {
            query.validate().map_err(AppError::Validation)?;
            if !seen.insert(query.name.as_str()) {
                return Err(AppError::validation(format!(
                    "Duplicate query name '{}'",
                    query.name
                )));
            }
        }
        Ok(())
    }

    /// Queries that are enabled for execution.
    pub fn enabled_queries(&self) -> Vec<&Query> {
        self.queries.iter().filter(|q| q.enabled).collect()
    }
}

/// Monitoring behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Upstream API base URL
    #[serde(default = "defaults::api_url")]
    pub api_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Per-request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Maximum concurrent query executions
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Default posted-date lookback window in days
    #[serde(default = "defaults::lookback_days")]
    pub lookback_days: i64,

    /// Fraction of queries allowed to fail before the run aborts
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: f64,

    /// Tracked entries unseen for this many days are pruned
    #[serde(default = "defaults::state_max_age_days")]
    pub state_max_age_days: i64,

    /// Tracked entries absent from listings for this many days count as expired
    #[serde(default = "defaults::expiry_days")]
    pub expiry_days: i64,

    /// Queue low-priority notifications for digesting instead of sending
    #[serde(default)]
    pub digest_mode: bool,

    /// Oldest-pending age that forces a digest flush, in hours
    #[serde(default = "defaults::digest_max_age_hours")]
    pub digest_max_age_hours: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_url: defaults::api_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            max_concurrent: defaults::max_concurrent(),
            lookback_days: defaults::lookback_days(),
            failure_threshold: defaults::failure_threshold(),
            state_max_age_days: defaults::state_max_age_days(),
            expiry_days: defaults::expiry_days(),
            digest_mode: false,
            digest_max_age_hours: defaults::digest_max_age_hours(),
        }
    }
}

/// Retry and backoff tuning for upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial call
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "defaults::initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff delay ceiling in milliseconds
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt
    #[serde(default = "defaults::backoff_factor")]
    pub backoff_factor: f64,

    /// Add bounded random jitter to each delay
    #[serde(default = "defaults::jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            initial_delay_ms: defaults::initial_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
            backoff_factor: defaults::backoff_factor(),
            jitter: defaults::jitter(),
        }
    }
}

/// Response cache settings. Disabled by default; every search hits the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Directory holding cached responses
    #[serde(default = "defaults::cache_dir")]
    pub dir: String,

    /// Entry lifetime in minutes
    #[serde(default = "defaults::cache_ttl_minutes")]
    pub ttl_minutes: i64,

    /// Entry-count ceiling; oldest entries are evicted beyond it
    #[serde(default = "defaults::cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: defaults::cache_dir(),
            ttl_minutes: defaults::cache_ttl_minutes(),
            max_entries: defaults::cache_max_entries(),
        }
    }
}

/// Notification channel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub email: EmailConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub issues: IssueConfig,
}

/// Email channel, delivered through an HTTP mail API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint of the mail submission API
    #[serde(default)]
    pub api_url: String,

    /// Bearer token for the mail API
    #[serde(default)]
    pub api_token: String,

    #[serde(default)]
    pub from_address: String,

    #[serde(default)]
    pub to_addresses: Vec<String>,
}

/// Chat webhook channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub channel: Option<String>,
}

/// Issue-tracker channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueConfig {
    #[serde(default)]
    pub enabled: bool,

    /// REST API base, e.g. https://api.github.com
    #[serde(default = "defaults::issue_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub repository: String,

    #[serde(default)]
    pub labels: Vec<String>,
}

mod defaults {
    pub fn api_url() -> String {
        "https://api.listings.example.gov/v2/search".to_string()
    }

    pub fn user_agent() -> String {
        "bidwatch/0.1".to_string()
    }

    pub fn timeout() -> u64 {
        30
    }

    pub fn max_concurrent() -> usize {
        3
    }

    pub fn lookback_days() -> i64 {
        3
    }

    pub fn failure_threshold() -> f64 {
        0.5
    }

    pub fn state_max_age_days() -> i64 {
        90
    }

    pub fn expiry_days() -> i64 {
        14
    }

    pub fn digest_max_age_hours() -> i64 {
        4
    }

    pub fn max_retries() -> u32 {
        3
    }

    pub fn initial_delay_ms() -> u64 {
        1_000
    }

    pub fn max_delay_ms() -> u64 {
        30_000
    }

    pub fn backoff_factor() -> f64 {
        2.0
    }

    pub fn jitter() -> bool {
        true
    }

    pub fn issue_api_url() -> String {
        "https://api.github.com".to_string()
    }

    pub fn cache_dir() -> String {
        ".bidwatch-cache".to_string()
    }

    pub fn cache_ttl_minutes() -> i64 {
        60
    }

    pub fn cache_max_entries() -> usize {
        256
    }
}
