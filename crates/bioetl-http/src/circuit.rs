//! Per-source circuit breaker.
//!
//! `Closed` counts consecutive failed requests; at the threshold it opens.
//! While `Open` every caller is rejected without I/O. Once the cooldown has
//! elapsed the next caller flips it to `HalfOpen` and receives the single
//! trial permit; the trial's result closes or re-opens the circuit. A trial
//! abandoned before it settles (the request future was dropped) gives the
//! permit back through [`TrialGuard`].

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub trial_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Answer to "may I call upstream?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Allowed,
    /// Half-open trial: one attempt, no retries
    Trial,
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    source: String,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(source: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            source: source.into(),
            threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown(),
            state: Mutex::new(CircuitBreakerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_acquire(&self) -> Permit {
        let mut state = self.lock();
        match state.status {
            CircuitStatus::Closed => Permit::Allowed,
            CircuitStatus::Open => {
                let opened_at = state.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= self.cooldown {
                    state.status = CircuitStatus::HalfOpen;
                    state.trial_in_flight = true;
                    info!(source = %self.source, "Circuit half-open, sending trial request");
                    Permit::Trial
                } else {
                    Permit::Rejected { retry_in: self.cooldown - elapsed }
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    Permit::Rejected { retry_in: Duration::ZERO }
                } else {
                    state.trial_in_flight = true;
                    Permit::Trial
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.status != CircuitStatus::Closed {
            info!(source = %self.source, "Circuit closed");
        }
        *state = CircuitBreakerState::default();
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        match state.status {
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
                warn!(
                    source = %self.source,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Trial request failed, circuit re-opened"
                );
            }
            CircuitStatus::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.threshold {
                    state.status = CircuitStatus::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(
                        source = %self.source,
                        failures = state.consecutive_failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            // Straggler result from a request issued before the circuit opened.
            CircuitStatus::Open => {}
        }
    }

    /// Hold the trial permit for the duration of one request.
    pub fn trial_guard(&self) -> TrialGuard<'_> {
        TrialGuard { breaker: self }
    }

    fn release_trial(&self) {
        let mut state = self.lock();
        if state.status == CircuitStatus::HalfOpen && state.trial_in_flight {
            state.trial_in_flight = false;
            debug!(source = %self.source, "Trial request abandoned, permit released");
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    pub fn status(&self) -> CircuitStatus {
        self.lock().status
    }
}

/// Releases an unsettled half-open trial on drop. A settled trial has
/// already left `HalfOpen`, so dropping the guard afterwards is a no-op.
#[must_use = "the trial permit is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        self.breaker.release_trial();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "chembl",
            &CircuitBreakerConfig { failure_threshold: threshold, cooldown_secs },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 60);
        for _ in 0..2 {
            cb.record_failure();
            assert_eq!(cb.status(), CircuitStatus::Closed);
        }
        cb.record_failure();
        assert_eq!(cb.status(), CircuitStatus::Open);
        assert!(matches!(cb.try_acquire(), Permit::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let cb = breaker(3, 60);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.snapshot().consecutive_failures, 1);
        assert_eq!(cb.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let cb = breaker(1, 60);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(matches!(cb.try_acquire(), Permit::Rejected { .. }));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.try_acquire(), Permit::Trial);
        assert_eq!(cb.status(), CircuitStatus::HalfOpen);
        // Everyone else keeps short-circuiting while the trial is out.
        assert!(matches!(cb.try_acquire(), Permit::Rejected { .. }));

        cb.record_success();
        assert_eq!(cb.status(), CircuitStatus::Closed);
        assert_eq!(cb.try_acquire(), Permit::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_cooldown() {
        let cb = breaker(1, 60);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.try_acquire(), Permit::Trial);
        cb.record_failure();
        assert_eq!(cb.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        match cb.try_acquire() {
            Permit::Rejected { retry_in } => assert_eq!(retry_in, Duration::from_secs(30)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_releases_permit() {
        let cb = breaker(1, 60);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.try_acquire(), Permit::Trial);
        let guard = cb.trial_guard();
        assert!(matches!(cb.try_acquire(), Permit::Rejected { .. }));

        drop(guard);
        assert!(!cb.snapshot().trial_in_flight);
        assert_eq!(cb.status(), CircuitStatus::HalfOpen);
        assert_eq!(cb.try_acquire(), Permit::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_trial_ignores_guard_drop() {
        let cb = breaker(1, 60);
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.try_acquire(), Permit::Trial);
        {
            let _guard = cb.trial_guard();
            cb.record_failure();
        }
        assert_eq!(cb.status(), CircuitStatus::Open);
        assert!(matches!(cb.try_acquire(), Permit::Rejected { .. }));
    }
}
