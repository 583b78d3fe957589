//! bioetl-http — Resilient HTTP client shared by every source pipeline.
//!
//! One [`ResilientClient`] per upstream source bundles:
//!   - a pluggable [`Transport`] (reqwest in production)
//!   - retry with exponential backoff, driven by an explicit attempt state machine
//!   - a sliding-window token bucket rate limiter
//!   - a circuit breaker (Closed → Open → HalfOpen)
//!   - a release-namespaced TTL cache, optionally persisted to disk
//!   - fallback record synthesis so a failing identifier never aborts a batch
//!
//! Batching, ordered bounded-concurrency fetching and pagination helpers live
//! in [`batch`].

pub mod batch;
pub mod cache;
pub mod circuit;
pub mod client;
pub mod config;
pub mod error;
pub mod fallback;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use batch::{batches, fetch_ordered, paginate, Page, MAX_WORKERS};
pub use cache::{CacheEntry, CacheKey, ResponseCache};
pub use circuit::{CircuitBreaker, CircuitBreakerState, CircuitStatus, Permit, TrialGuard};
pub use client::{RequestOutcome, ResilientClient};
pub use config::{CacheConfig, CircuitBreakerConfig, HttpClientConfig, RateLimitConfig, RetryConfig};
pub use error::{HttpError, Result};
pub use fallback::{FallbackReason, FallbackRecord};
pub use rate_limit::{RateLimitBucket, RateLimiter};
pub use retry::{AttemptOutcome, ErrorKind, FailureReason, RetryPolicy};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};

pub use reqwest::Method;
