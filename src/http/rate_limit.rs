//! Token bucket shared by every request made through one client.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests allowed per `per`
    pub requests: u32,
    #[serde(with = "humantime_serde", default = "default_per")]
    pub per: Duration,
    /// Bucket size; defaults to `requests`
    #[serde(default)]
    pub burst: Option<u32>,
}

fn default_per() -> Duration {
    Duration::from_secs(1)
}

impl RateLimit {
    pub fn per_second(requests: u32) -> Self {
        Self {
            requests,
            per: Duration::from_secs(1),
            burst: None,
        }
    }

    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests,
            per: Duration::from_secs(60),
            burst: None,
        }
    }

    fn tokens_per_second(&self) -> f64 {
        self.requests as f64 / self.per.as_secs_f64().max(f64::EPSILON)
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    rate: f64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let capacity = limit.burst.unwrap_or(limit.requests).max(1) as f64;
        Self {
            limit,
            rate: limit.tokens_per_second(),
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Wait for a token. Waiters are served in arrival order because the
    /// bucket lock is held while sleeping.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        let mut bucket = self.bucket.lock().await;
        loop {
            self.refill(&mut bucket);
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                let waited = started.elapsed();
                if !waited.is_zero() {
                    tracing::trace!(waited_ms = waited.as_millis() as u64, "Rate limiter delayed request");
                }
                return waited;
            }
            let missing = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(missing / self.rate.max(f64::EPSILON));
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let limiter = RateLimiter::new(RateLimit::per_second(2));

        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(limiter.acquire().await, Duration::ZERO);

        let waited = limiter.acquire().await;
        assert!(waited >= Duration::from_millis(499), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(510), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_does_not_wait() {
        let limiter = RateLimiter::new(RateLimit::per_minute(1));
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate() {
        let limiter = RateLimiter::new(RateLimit::per_second(10));
        let start = Instant::now();
        for _ in 0..30 {
            limiter.acquire().await;
        }
        // 10 from the initial bucket, 20 more at 10/s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1990), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(2100), "elapsed {:?}", elapsed);
    }

    #[test]
    fn test_rate_limit_from_yaml() {
        let limit: RateLimit = serde_yaml::from_str("requests: 600\nper: 1m\n").unwrap();
        assert_eq!(limit, RateLimit::per_minute(600));
        let limit: RateLimit = serde_yaml::from_str("requests: 5\nburst: 10\n").unwrap();
        assert_eq!(limit.per, Duration::from_secs(1));
        assert_eq!(limit.burst, Some(10));
    }
}
