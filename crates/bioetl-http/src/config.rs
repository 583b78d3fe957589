//! Configuration for the resilient HTTP client.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::MAX_WORKERS;
use crate::error::{HttpError, Result};

/// Per-source client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Base URL every relative path is joined to
    #[serde(default)]
    pub base_url: String,

    /// Per-request timeout (cancels only the individual call)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Polite-pool user agent (Crossref etiquette asks for a mailto)
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Concurrent in-flight requests (1–4)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Identifiers per upstream call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Stop following pagination links after this many pages
    #[serde(default)]
    pub max_pages: Option<usize>,
}

fn default_timeout_secs() -> u64 { 30 }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_user_agent() -> String { "bioetl/0.1 (mailto:bioetl@example.com)".to_string() }
fn default_workers() -> usize { 2 }
fn default_batch_size() -> usize { 25 }

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            headers: BTreeMap::new(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            max_pages: None,
        }
    }
}

impl HttpClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(HttpError::Config("base_url must be set".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(HttpError::Config("timeout_secs must be positive".to_string()));
        }
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(HttpError::Config(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.batch_size == 0 {
            return Err(HttpError::Config("batch_size must be positive".to_string()));
        }
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.circuit_breaker.validate()
    }
}

// ── Retry ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Statuses that trigger a retry. 429 is retried even when absent
    #[serde(default = "default_retry_statuses")]
    pub statuses: Vec<u16>,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Honour `Retry-After` on 429/503, still capped at `backoff_max_ms`
    #[serde(default = "default_true")]
    pub respect_retry_after: bool,
}

fn default_max_attempts() -> u32 { 5 }
fn default_retry_statuses() -> Vec<u16> { vec![408, 425, 429, 500, 502, 503, 504] }
fn default_backoff_initial_ms() -> u64 { 500 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_backoff_max_ms() -> u64 { 30_000 }
fn default_true() -> bool { true }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            statuses: default_retry_statuses(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            respect_retry_after: true,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HttpError::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(HttpError::Config("retry.backoff_multiplier must be >= 1.0".to_string()));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(HttpError::Config(
                "retry.backoff_initial_ms exceeds retry.backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Rate limit ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls permitted per period; 0 disables limiting
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,

    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Upper bound of the random delay added after a permit is granted
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_max_calls() -> u32 { 3 }
fn default_period_ms() -> u64 { 1_000 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            period_ms: default_period_ms(),
            jitter_ms: 0,
        }
    }
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_calls > 0 && self.period_ms == 0 {
            return Err(HttpError::Config("rate_limit.period_ms must be positive".to_string()));
        }
        Ok(())
    }
}

// ── Circuit breaker ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed requests before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_cooldown_secs() -> u64 { 60 }

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(HttpError::Config(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Defaults to the source name
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Persist entries here so they survive across runs
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_ttl_secs() -> u64 { 86_400 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: None,
            ttl_secs: default_ttl_secs(),
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate_once_base_url_set() {
        let cfg = HttpClientConfig::default();
        assert!(cfg.validate().is_err());
        let cfg = cfg.with_base_url("https://www.ebi.ac.uk/chembl/api/data");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_workers_bounded() {
        let mut cfg = HttpClientConfig::default().with_base_url("https://api.crossref.org");
        cfg.workers = 8;
        assert!(cfg.validate().is_err());
        cfg.workers = 4;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let cfg: HttpClientConfig = serde_json::from_value(serde_json::json!({
            "base_url": "https://x.org",
            "retry": { "max_attempts": 3 }
        }))
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.statuses, vec![408, 425, 429, 500, 502, 503, 504]);
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
    }
}
