//! Fixed-window rate limiter for pairing and login attempts.
//!
//! One window per key. A window resets once `now - start >= window`,
//! otherwise every attempt bumps its count. Attempts past the limit are
//! refused without blocking. Windows live only in memory.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default attempts allowed per window.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Map size beyond which stale windows are swept.
const PRUNE_THRESHOLD: usize = 1024;

/// Attempt counter for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub start_ms: u64,
    pub count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, RateLimitWindow>,
    window_ms: u64,
    max_attempts: u32,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_ATTEMPTS)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_attempts,
        }
    }

    /// Record an attempt for `key` at `now_ms`. Returns `false` once the key
    /// has used up its window.
    ///
    /// A blank key is never limited.
    pub fn try_acquire(&self, key: &str, now_ms: u64) -> bool {
        if key.trim().is_empty() {
            return true;
        }

        if self.windows.len() > PRUNE_THRESHOLD {
            self.prune(now_ms);
        }

        // The entry guard holds the shard lock, so read-modify-write is atomic per key.
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert(RateLimitWindow {
                start_ms: now_ms,
                count: 0,
            });

        if now_ms.saturating_sub(window.start_ms) >= self.window_ms {
            window.start_ms = now_ms;
            window.count = 0;
        }

        if window.count >= self.max_attempts {
            tracing::debug!(key, count = window.count, "Rate limit exceeded");
            return false;
        }
        window.count += 1;
        true
    }

    /// Convenience wrapper stamped with the wall clock.
    pub fn try_acquire_now(&self, key: &str) -> bool {
        self.try_acquire(key, now_ms())
    }

    /// Drop windows that ended more than one full window ago.
    pub fn prune(&self, now_ms: u64) {
        let horizon = self.window_ms.saturating_mul(2);
        self.windows
            .retain(|_, w| now_ms.saturating_sub(w.start_ms) < horizon);
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn allows_max_then_refuses() {
        let limiter = RateLimiter::default();
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            assert!(limiter.try_acquire("k", 1_000));
        }
        assert!(!limiter.try_acquire("k", 1_000));
        assert!(!limiter.try_acquire("k", 30_000));
    }

    #[test]
    fn window_rollover_resets_count() {
        let limiter = RateLimiter::default();
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            limiter.try_acquire("k", 0);
        }
        assert!(!limiter.try_acquire("k", 59_999));
        assert!(limiter.try_acquire("k", 60_000));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.try_acquire("a", 0));
        assert!(!limiter.try_acquire("a", 0));
        assert!(limiter.try_acquire("b", 0));
    }

    #[test]
    fn blank_key_is_never_limited() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        for _ in 0..20 {
            assert!(limiter.try_acquire("", 0));
            assert!(limiter.try_acquire("   ", 0));
        }
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn stale_windows_are_pruned_past_threshold() {
        let limiter = RateLimiter::default();
        for i in 0..=PRUNE_THRESHOLD {
            limiter.try_acquire(&format!("old-{i}"), 0);
        }
        assert_eq!(limiter.tracked_keys(), PRUNE_THRESHOLD + 1);

        limiter.try_acquire("fresh", 120_000);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn concurrent_attempts_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::default());
        let granted = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if limiter.try_acquire("shared", 5_000) {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), DEFAULT_MAX_ATTEMPTS);
    }
}
