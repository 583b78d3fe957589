//! Sliding-window token bucket.
//!
//! Every granted permit spends a token that comes back exactly one `period`
//! later, so no window of length `period` ever sees more than `max_calls`
//! grants. Shared by all workers of a source.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

/// Point-in-time view of the bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitBucket {
    pub tokens: u32,
    pub capacity: u32,
    /// Tokens per second
    pub refill_rate: f64,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    period: Duration,
    jitter_ms: u64,
    /// Instants at which currently spent tokens were granted, oldest first
    spent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            capacity: config.max_calls,
            period: config.period(),
            jitter_ms: config.jitter_ms,
            spent: Mutex::new(VecDeque::with_capacity(config.max_calls as usize)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Wait for a permit. Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }
        let started = Instant::now();

        loop {
            let wake_at = {
                let mut spent = self.spent.lock().await;
                let now = Instant::now();
                purge(&mut spent, now, self.period);
                if (spent.len() as u32) < self.capacity {
                    spent.push_back(now);
                    None
                } else {
                    // Full: the oldest token is the next to come back.
                    spent.front().map(|oldest| *oldest + self.period)
                }
            };

            match wake_at {
                None => break,
                Some(at) => {
                    debug!(wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64, "Rate limit reached, waiting");
                    sleep_until(at).await;
                }
            }
        }

        if self.jitter_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
            sleep(Duration::from_millis(jitter)).await;
        }

        started.elapsed()
    }

    pub async fn bucket(&self) -> RateLimitBucket {
        let mut spent = self.spent.lock().await;
        purge(&mut spent, Instant::now(), self.period);
        let refill_rate = if self.period.is_zero() {
            0.0
        } else {
            self.capacity as f64 / self.period.as_secs_f64()
        };
        RateLimitBucket {
            tokens: self.capacity.saturating_sub(spent.len() as u32),
            capacity: self.capacity,
            refill_rate,
        }
    }
}

fn purge(spent: &mut VecDeque<Instant>, now: Instant, period: Duration) {
    while let Some(oldest) = spent.front() {
        if *oldest + period <= now {
            spent.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_calls: u32, period_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig { max_calls, period_ms, jitter_ms: 0 })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity_is_immediate() {
        let rl = limiter(3, 1_000);
        for _ in 0..3 {
            assert_eq!(rl.acquire().await, Duration::ZERO);
        }
        assert_eq!(rl.bucket().await.tokens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_window_exceeds_capacity() {
        let rl = limiter(3, 1_000);
        let origin = Instant::now();
        let mut grants = Vec::new();
        for _ in 0..10 {
            rl.acquire().await;
            grants.push(Instant::now() - origin);
        }
        // Any window of one period contains at most three grants.
        for (i, start) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .filter(|t| **t < *start + Duration::from_millis(1_000))
                .count();
            assert!(in_window <= 3, "window starting at {start:?} saw {in_window} grants");
        }
        assert_eq!(grants[3], Duration::from_millis(1_000));
        assert_eq!(grants[9], Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_after_period() {
        let rl = limiter(2, 500);
        rl.acquire().await;
        rl.acquire().await;
        assert_eq!(rl.bucket().await.tokens, 0);
        tokio::time::advance(Duration::from_millis(500)).await;
        let b = rl.bucket().await;
        assert_eq!(b.tokens, 2);
        assert_eq!(b.refill_rate, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_limiter_never_waits() {
        let rl = limiter(0, 1_000);
        for _ in 0..100 {
            assert_eq!(rl.acquire().await, Duration::ZERO);
        }
    }
}
