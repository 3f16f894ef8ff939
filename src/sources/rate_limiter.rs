//! Token bucket pacing for upstream provider requests.
//!
//! One limiter is shared by every job talking to the provider. Besides the
//! steady refill, a 429 from upstream can pause the whole bucket so that all
//! callers back off together instead of hammering an exhausted quota.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    paused_until: Option<Instant>,
}

/// A token bucket rate limiter.
///
/// Allows bursts of up to `capacity` requests, refilled continuously at
/// `requests_per_minute / 60` tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, requests_per_minute: u32) -> Self {
        let per_minute = requests_per_minute.max(1) as f64;
        let capacity = (per_minute / 60.0).ceil().max(1.0);

        Self {
            name: name.into(),
            capacity,
            refill_per_sec: per_minute / 60.0,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
                paused_until: None,
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();

                match bucket.paused_until {
                    Some(until) if until > now => until - now,
                    _ => {
                        bucket.paused_until = None;
                        self.refill(&mut bucket, now);
                        if bucket.tokens >= 1.0 {
                            bucket.tokens -= 1.0;
                            return;
                        }
                        Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
                    }
                }
            };

            debug!(
                limiter = %self.name,
                wait_ms = wait.as_millis() as u64,
                "Rate limited, waiting for token"
            );
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        if matches!(bucket.paused_until, Some(until) if until > now) {
            return false;
        }
        self.refill(&mut bucket, now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Stop handing out tokens for `duration`, e.g. after an upstream 429.
    /// Overlapping pauses keep the later deadline.
    pub async fn pause_for(&self, duration: Duration) {
        let mut bucket = self.bucket.lock().await;
        let until = Instant::now() + duration;
        if bucket.paused_until.map_or(true, |current| until > current) {
            bucket.paused_until = Some(until);
        }
        bucket.tokens = 0.0;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_capacity() {
        assert_eq!(RateLimiter::new("test", 300).capacity(), 5);
        assert_eq!(RateLimiter::new("test", 5).capacity(), 1);
    }

    #[tokio::test]
    async fn test_try_acquire_exhausts_bucket() {
        let limiter = RateLimiter::new("test", 60);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        // 100 req/sec
        let limiter = RateLimiter::new("test", 6000);
        while limiter.try_acquire().await {}

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_pause_blocks_tokens() {
        let limiter = RateLimiter::new("test", 6000);
        limiter.pause_for(Duration::from_millis(50)).await;
        assert!(!limiter.try_acquire().await);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
