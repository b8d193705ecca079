//! In-memory sliding-window rate limiter
//!
//! Keyed by an opaque identifier (`"vin:user:<uuid>"`, `"plate:ip:<addr>"`).
//! Each key tracks the timestamps of its requests inside the window; a
//! request is allowed while fewer than `limit` timestamps remain in the
//! window. State is process-local, so limits apply per instance.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Window length for all limits
const WINDOW: Duration = Duration::from_secs(60);

/// Result of a rate limit check
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest request leaves the window; only set when
    /// the request was rejected
    pub retry_after_seconds: Option<u64>,
}

/// Sliding-window rate limiter over an in-memory map
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Check and record a request for `key`, allowing at most `limit`
    /// requests per window
    pub async fn check(&self, key: &str, limit: u32) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let hits = windows.entry(key.to_string()).or_default();

        while hits
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            hits.pop_front();
        }

        if (hits.len() as u32) < limit {
            hits.push_back(now);
            RateLimitResult {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(hits.len() as u32),
                retry_after_seconds: None,
            }
        } else {
            let retry_after_seconds = hits
                .front()
                .map(|t| WINDOW.saturating_sub(now.duration_since(*t)).as_secs().max(1));
            RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_seconds,
            }
        }
    }

    /// Drop keys whose entire window has aged out
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        windows.retain(|_, hits| {
            hits.back()
                .is_some_and(|t| now.duration_since(*t) < WINDOW)
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_request_allowed() {
        let limiter = RateLimiter::new_in_memory();

        let result = limiter.check("user:a", 10).await;
        assert!(result.allowed, "First request should be allowed");
        assert_eq!(result.remaining, 9, "Should have 9 remaining");
    }

    #[tokio::test]
    async fn test_request_over_limit_rejected() {
        let limiter = RateLimiter::new_in_memory();

        for i in 0..10 {
            let result = limiter.check("user:a", 10).await;
            assert!(result.allowed, "Request {} should be allowed", i);
        }

        let result = limiter.check("user:a", 10).await;
        assert!(!result.allowed, "11th request should be rejected");
        assert!(
            result.retry_after_seconds.is_some(),
            "Should have retry_after"
        );
    }

    #[tokio::test]
    async fn test_different_keys_isolated() {
        let limiter = RateLimiter::new_in_memory();

        for _ in 0..5 {
            limiter.check("user:a", 5).await;
        }

        let blocked = limiter.check("user:a", 5).await;
        assert!(!blocked.allowed, "Key a should be blocked");

        let other = limiter.check("user:b", 5).await;
        assert!(other.allowed, "Key b should be allowed");
    }

    #[tokio::test]
    async fn test_concurrent_requests_respect_limit() {
        use tokio::sync::Barrier;

        let limiter = Arc::new(RateLimiter::new_in_memory());

        for _ in 0..5 {
            limiter.check("user:a", 10).await;
        }

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                limiter.check("user:a", 10).await
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 5, "Exactly 5 of 10 concurrent requests fit the window");
    }

    #[tokio::test]
    async fn test_cleanup_doesnt_corrupt_state() {
        let limiter = RateLimiter::new_in_memory();

        for _ in 0..5 {
            limiter.check("user:a", 10).await;
        }

        limiter.cleanup().await;

        let result = limiter.check("user:a", 10).await;
        assert!(result.allowed, "Should still work after cleanup");
        assert_eq!(result.remaining, 4);
    }
}
