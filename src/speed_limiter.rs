//! Global bandwidth limit shared by every connection
//!
//! A token bucket holding at most one second of traffic. Connections charge
//! body bytes as they arrive; a charge larger than the balance drives the
//! bucket into debt and the caller sleeps until the debt is repaid, so bursts
//! never need to be split.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Longest single sleep; short enough that limit changes are noticed quickly
const MAX_SLEEP: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Bucket {
    /// Bytes per second, 0 = unlimited
    rate: u64,
    /// Balance in bytes; negative while in debt
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        if self.rate > 0 {
            self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        }
    }
}

/// Cloneable handle to the shared bucket
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

impl SpeedLimiter {
    /// Limiter at `limit_bps` bytes per second (`None` = unlimited)
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let rate = limit_bps.unwrap_or(0);
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                rate,
                tokens: rate as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    fn bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Change the limit; takes effect for waiting callers within one sleep slice
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        let mut bucket = self.bucket();
        bucket.refill(Instant::now());
        bucket.rate = limit_bps.unwrap_or(0);
        bucket.tokens = bucket.tokens.min(bucket.rate as f64);
        tracing::info!(limit_bps = ?limit_bps, "bandwidth limit changed");
    }

    /// Current limit
    pub fn limit(&self) -> Option<u64> {
        match self.bucket().rate {
            0 => None,
            rate => Some(rate),
        }
    }

    /// Charge `bytes` and wait until the bucket is out of debt
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        {
            let mut bucket = self.bucket();
            if bucket.rate == 0 {
                return;
            }
            bucket.refill(Instant::now());
            bucket.tokens -= bytes as f64;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket();
                if bucket.rate == 0 {
                    bucket.tokens = 0.0;
                    return;
                }
                bucket.refill(Instant::now());
                if bucket.tokens >= 0.0 {
                    return;
                }
                Duration::from_secs_f64(-bucket.tokens / bucket.rate as f64)
            };
            tokio::time::sleep(wait.clamp(Duration::from_millis(5), MAX_SLEEP)).await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = SpeedLimiter::new(None);
        let start = Instant::now();
        limiter.acquire(100 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.limit(), None);
    }

    #[tokio::test]
    async fn within_burst_returns_immediately() {
        let limiter = SpeedLimiter::new(Some(1_000_000));
        let start = Instant::now();
        limiter.acquire(500_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn debt_is_paid_by_waiting() {
        let limiter = SpeedLimiter::new(Some(100_000));
        limiter.acquire(100_000).await;
        let start = Instant::now();
        // 30 KB of debt at 100 KB/s is ~300 ms
        limiter.acquire(30_000).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "waited {elapsed:?}");
    }

    #[tokio::test]
    async fn lifting_the_limit_releases_waiters() {
        let limiter = SpeedLimiter::new(Some(1_000));
        limiter.acquire(1_000).await;
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(1_000_000).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.set_limit(None);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should finish once unlimited")
            .unwrap();
    }

    #[test]
    fn clones_share_one_bucket() {
        let a = SpeedLimiter::new(Some(10));
        let b = a.clone();
        b.set_limit(Some(20));
        assert_eq!(a.limit(), Some(20));
    }
}
