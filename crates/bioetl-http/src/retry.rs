//! Retry policy and the per-attempt outcome state machine.
//!
//! A single attempt is classified into an [`AttemptOutcome`]; the client's
//! loop decides whether to sleep and try again or to synthesize a fallback.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::transport::{HttpResponse, TransportError};

/// Error taxonomy for failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 5xx, 408/425, timeouts, connection drops
    TransientNetwork,
    /// 429
    RateLimitExceeded,
    /// Non-retryable status, e.g. 400/404
    HttpStatus,
    /// Malformed request; will never succeed
    Request,
    /// Short-circuited by an open breaker; no I/O happened
    CircuitOpen,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork  => "TransientNetworkError",
            ErrorKind::RateLimitExceeded => "RateLimitExceeded",
            ErrorKind::HttpStatus        => "HttpStatusError",
            ErrorKind::Request           => "RequestError",
            ErrorKind::CircuitOpen       => "CircuitOpenError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl FailureReason {
    /// Failures that say something about upstream health and feed the
    /// circuit breaker. Client errors and 429 do not.
    pub fn is_upstream_failure(&self) -> bool {
        match self.kind {
            ErrorKind::TransientNetwork => true,
            ErrorKind::HttpStatus => self.status.map(|s| s >= 500).unwrap_or(false),
            ErrorKind::RateLimitExceeded | ErrorKind::Request | ErrorKind::CircuitOpen => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(HttpResponse),
    RetryableFailure(FailureReason),
    FallbackRequired(FailureReason),
}

/// Retry policy derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    retry_statuses: BTreeSet<u16>,
    initial: Duration,
    multiplier: f64,
    max_backoff: Duration,
    respect_retry_after: bool,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            retry_statuses: cfg.statuses.iter().copied().collect(),
            initial: Duration::from_millis(cfg.backoff_initial_ms),
            multiplier: cfg.backoff_multiplier,
            max_backoff: Duration::from_millis(cfg.backoff_max_ms),
            respect_retry_after: cfg.respect_retry_after,
        }
    }

    /// 429 is always retried; other statuses only when configured.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        status == 429 || self.retry_statuses.contains(&status)
    }

    /// Delay after the `attempt`-th failed attempt (1-based):
    /// `initial * multiplier^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Backoff raised to the server's `Retry-After` hint, still capped.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.backoff(attempt);
        match retry_after {
            Some(hint) if self.respect_retry_after => base.max(hint).min(self.max_backoff),
            _ => base,
        }
    }

    /// Classify one attempt.
    pub fn classify(&self, result: Result<HttpResponse, TransportError>) -> AttemptOutcome {
        match result {
            Ok(resp) if resp.is_success() => AttemptOutcome::Success(resp),
            Ok(resp) => {
                let kind = match resp.status {
                    429 => ErrorKind::RateLimitExceeded,
                    s if self.is_retryable_status(s) => ErrorKind::TransientNetwork,
                    _ => ErrorKind::HttpStatus,
                };
                let reason = FailureReason {
                    kind,
                    status: Some(resp.status),
                    message: format!("HTTP {}", resp.status),
                    retry_after: resp.retry_after(),
                };
                if self.is_retryable_status(resp.status) {
                    AttemptOutcome::RetryableFailure(reason)
                } else {
                    AttemptOutcome::FallbackRequired(reason)
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                let reason = FailureReason {
                    kind: if retryable { ErrorKind::TransientNetwork } else { ErrorKind::Request },
                    status: None,
                    message: e.to_string(),
                    retry_after: None,
                };
                if retryable {
                    AttemptOutcome::RetryableFailure(reason)
                } else {
                    AttemptOutcome::FallbackRequired(reason)
                }
            }
        }
    }
}
