//! Per-client submission windows.
//!
//! Not synchronized on its own: the scheduler holds it under its admission
//! lock so the check and the record happen atomically with slot acquisition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct WindowEntry {
    submissions: u32,
    window_start: Instant,
}

/// Fixed-window counter keyed by client.
pub struct ClientRateLimiter {
    max_per_window: u32,
    window: Duration,
    entries: HashMap<String, WindowEntry>,
}

impl ClientRateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            entries: HashMap::new(),
        }
    }

    /// `Err(retry_after_secs)` when `client` has used up its window.
    pub fn check(&self, client: &str, now: Instant) -> Result<(), u64> {
        let Some(entry) = self.entries.get(client) else {
            return Ok(());
        };
        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= self.window || entry.submissions < self.max_per_window {
            return Ok(());
        }
        let remaining = self.window - elapsed;
        Err(ceil_secs(remaining))
    }

    /// Count one admitted submission.
    pub fn record(&mut self, client: &str, now: Instant) {
        let window = self.window;
        let entry = self
            .entries
            .entry(client.to_string())
            .or_insert(WindowEntry {
                submissions: 0,
                window_start: now,
            });
        if now.saturating_duration_since(entry.window_start) >= window {
            entry.submissions = 0;
            entry.window_start = now;
        }
        entry.submissions += 1;
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.window_start) < window);
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let mut limiter = ClientRateLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check("a", now).is_ok());
        limiter.record("a", now);
        assert!(limiter.check("a", now).is_ok());
        limiter.record("a", now);
        let retry = limiter.check("a", now + Duration::from_secs(15)).unwrap_err();
        assert_eq!(retry, 45);
    }

    #[test]
    fn test_clients_are_independent() {
        let mut limiter = ClientRateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        limiter.record("a", now);
        assert!(limiter.check("a", now).is_err());
        assert!(limiter.check("b", now).is_ok());
    }

    #[test]
    fn test_window_resets() {
        let mut limiter = ClientRateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        limiter.record("a", now);
        let later = now + Duration::from_secs(61);
        assert!(limiter.check("a", later).is_ok());
        limiter.record("a", later);
        assert!(limiter.check("a", later).is_err());
    }

    #[test]
    fn test_prune_drops_stale_windows() {
        let mut limiter = ClientRateLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        limiter.record("a", now);
        limiter.record("b", now + Duration::from_secs(30));
        limiter.prune(now + Duration::from_secs(61));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        assert_eq!(ceil_secs(Duration::from_millis(10)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
    }
}
