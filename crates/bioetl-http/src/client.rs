//! The per-source resilient client.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::Method;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheKey, ResponseCache};
use crate::circuit::{CircuitBreaker, Permit};
use crate::config::{CacheConfig, HttpClientConfig};
use crate::error::{HttpError, Result};
use crate::fallback::{FallbackReason, FallbackRecord};
use crate::rate_limit::RateLimiter;
use crate::retry::{AttemptOutcome, ErrorKind, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};

/// Result of a logical request. Upstream failures are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Response(HttpResponse),
    Fallback(FallbackRecord),
}

impl RequestOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, RequestOutcome::Fallback(_))
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            RequestOutcome::Response(r) => Some(r),
            RequestOutcome::Fallback(_) => None,
        }
    }

    pub fn into_result(self) -> std::result::Result<HttpResponse, FallbackRecord> {
        match self {
            RequestOutcome::Response(r) => Ok(r),
            RequestOutcome::Fallback(f) => Err(f),
        }
    }
}

pub struct ResilientClient {
    source: String,
    base_url: String,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    cache: Option<ResponseCache>,
    cache_namespace: String,
    cache_ttl: Duration,
    release: OnceLock<String>,
    workers: usize,
    batch_size: usize,
    max_pages: Option<usize>,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("source", &self.source)
            .field("base_url", &self.base_url)
            .field("release", &self.release.get())
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Production client over reqwest.
    pub fn new(source: impl Into<String>, http: &HttpClientConfig, cache: &CacheConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(http)?);
        Self::with_transport(source, http, cache, transport)
    }

    pub fn with_transport(
        source: impl Into<String>,
        http: &HttpClientConfig,
        cache: &CacheConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        http.validate()?;
        let source = source.into();

        let response_cache = if cache.enabled {
            Some(match &cache.dir {
                Some(dir) => ResponseCache::persistent(dir)?,
                None => ResponseCache::in_memory(),
            })
        } else {
            None
        };

        Ok(Self {
            base_url: http.base_url.trim_end_matches('/').to_string(),
            transport,
            policy: RetryPolicy::from_config(&http.retry),
            limiter: RateLimiter::new(&http.rate_limit),
            breaker: CircuitBreaker::new(source.clone(), &http.circuit_breaker),
            cache: response_cache,
            cache_namespace: cache.namespace.clone().unwrap_or_else(|| source.clone()),
            cache_ttl: cache.ttl(),
            release: OnceLock::new(),
            workers: http.workers,
            batch_size: http.batch_size,
            max_pages: http.max_pages,
            source,
        })
    }

    /// Replace the response cache, e.g. with one driven by a manual clock.
    pub fn with_cache(mut self, cache: Option<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_pages(&self) -> Option<usize> {
        self.max_pages
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Bind the release snapshot used in cache keys. Binding the same value
    /// again is a no-op; a different value is refused.
    pub fn bind_release(&self, release: impl Into<String>) -> Result<&str> {
        let release = release.into();
        let bound = self.release.get_or_init(|| release.clone());
        if *bound != release {
            return Err(HttpError::ReleaseConflict {
                existing: bound.clone(),
                attempted: release,
            });
        }
        Ok(bound.as_str())
    }

    pub fn release(&self) -> Option<&str> {
        self.release.get().map(String::as_str)
    }

    /// Absolute URLs pass through; paths are joined to the base URL.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> RequestOutcome {
        self.request(Method::GET, path, params).await
    }

    /// Issue one logical request through cache, breaker, limiter and retries.
    #[instrument(skip(self, params), fields(source = %self.source))]
    pub async fn request(&self, method: Method, path: &str, params: &[(&str, &str)]) -> RequestOutcome {
        let req = self.build_request(method, path, params);

        let key = self.cache_key(&req);
        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            if let Some(hit) = cache.get(key) {
                match serde_json::from_value::<HttpResponse>(hit) {
                    Ok(resp) => return RequestOutcome::Response(resp),
                    Err(e) => warn!(key = %key, error = %e, "Undecodable cached response, refetching"),
                }
            }
        }

        let outcome = self.execute(&req).await;

        if let (Some(cache), Some(key), RequestOutcome::Response(resp)) = (&self.cache, &key, &outcome) {
            match serde_json::to_value(resp) {
                Ok(json) => {
                    if let Err(e) = cache.set(key, json, self.cache_ttl) {
                        warn!(key = %key, error = %e, "Failed to store cache entry");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "Response not cacheable"),
            }
        }
        outcome
    }

    /// Same as [`request`](Self::request) but never reads or writes the cache.
    /// Used for release discovery, which must see the live upstream.
    pub async fn request_uncached(&self, method: Method, path: &str, params: &[(&str, &str)]) -> RequestOutcome {
        let req = self.build_request(method, path, params);
        self.execute(&req).await
    }

    fn build_request(&self, method: Method, path: &str, params: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method,
            url: self.url_for(path),
            params: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    /// Only GETs are cached, and only once a release is bound.
    fn cache_key(&self, req: &HttpRequest) -> Option<CacheKey> {
        if req.method != Method::GET || self.cache.is_none() {
            return None;
        }
        let release = self.release()?;
        Some(CacheKey::new(&self.cache_namespace, release, req.cache_identifier()))
    }

    async fn execute(&self, req: &HttpRequest) -> RequestOutcome {
        let trial = match self.breaker.try_acquire() {
            Permit::Allowed => false,
            Permit::Trial => true,
            Permit::Rejected { retry_in } => {
                warn!(
                    url = %req.url,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Circuit open, request short-circuited"
                );
                return RequestOutcome::Fallback(FallbackRecord::circuit_open(&req.url));
            }
        };
        // Frees the half-open slot if this future is dropped mid-trial.
        let _trial = trial.then(|| self.breaker.trial_guard());
        let max_attempts = if trial { 1 } else { self.policy.max_attempts };

        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            attempt += 1;

            let result = self.transport.send(req).await;
            match self.policy.classify(result) {
                AttemptOutcome::Success(resp) => {
                    self.breaker.record_success();
                    if attempt > 1 {
                        info!(url = %req.url, status = resp.status, retries = attempt - 1, "Request succeeded after retries");
                    } else {
                        debug!(url = %req.url, status = resp.status, "Request succeeded");
                    }
                    return RequestOutcome::Response(resp);
                }
                AttemptOutcome::RetryableFailure(reason) if attempt < max_attempts => {
                    let delay = self.policy.delay_for(attempt, reason.retry_after);
                    warn!(
                        url = %req.url,
                        attempt,
                        status = ?reason.status,
                        error_type = reason.kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                AttemptOutcome::RetryableFailure(reason) => {
                    self.record_for_breaker(reason.is_upstream_failure());
                    let fb = FallbackRecord::from_failure(FallbackReason::MaxRetriesExceeded, &reason, attempt, &req.url);
                    warn!(
                        url = %req.url,
                        attempts = attempt,
                        status = ?reason.status,
                        error_type = %fb.error_type,
                        "Retries exhausted, synthesizing fallback"
                    );
                    return RequestOutcome::Fallback(fb);
                }
                AttemptOutcome::FallbackRequired(reason) => {
                    self.record_for_breaker(reason.is_upstream_failure());
                    let fallback_reason = match reason.kind {
                        ErrorKind::Request => FallbackReason::RequestError,
                        _ => FallbackReason::HttpError,
                    };
                    let fb = FallbackRecord::from_failure(fallback_reason, &reason, attempt, &req.url);
                    warn!(
                        url = %req.url,
                        status = ?reason.status,
                        reason = %fb.reason,
                        "Non-retryable failure, synthesizing fallback"
                    );
                    return RequestOutcome::Fallback(fb);
                }
            }
        }
    }

    /// Client errors and throttling say nothing about upstream health, but
    /// they still settle a half-open trial.
    fn record_for_breaker(&self, upstream_failure: bool) {
        if upstream_failure {
            self.breaker.record_failure();
        } else {
            self.breaker.record_success();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ResilientClient {
        ResilientClient::new(
            "chembl",
            &HttpClientConfig::default().with_base_url("https://www.ebi.ac.uk/chembl/api/data/"),
            &CacheConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_url_for_joins_and_passes_absolute() {
        let c = client();
        assert_eq!(c.url_for("/activity.json"), "https://www.ebi.ac.uk/chembl/api/data/activity.json");
        assert_eq!(c.url_for("status.json"), "https://www.ebi.ac.uk/chembl/api/data/status.json");
        assert_eq!(c.url_for("https://other.org/x"), "https://other.org/x");
    }

    #[test]
    fn test_bind_release_once() {
        let c = client();
        assert_eq!(c.bind_release("ChEMBL_34").unwrap(), "ChEMBL_34");
        assert!(c.bind_release("ChEMBL_34").is_ok());
        assert!(matches!(c.bind_release("ChEMBL_35"), Err(HttpError::ReleaseConflict { .. })));
    }

    #[test]
    fn test_no_cache_key_before_release_or_for_post() {
        let c = client();
        let get = c.build_request(Method::GET, "activity.json", &[]);
        assert!(c.cache_key(&get).is_none());
        c.bind_release("ChEMBL_34").unwrap();
        assert!(c.cache_key(&get).is_some());
        let post = c.build_request(Method::POST, "activity.json", &[]);
        assert!(c.cache_key(&post).is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let r = ResilientClient::new("x", &HttpClientConfig::default(), &CacheConfig::default());
        assert!(matches!(r, Err(HttpError::Config(_))));
    }
}
