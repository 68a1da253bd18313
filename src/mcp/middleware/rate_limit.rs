//! Fixed-window rate limiting per client and per tool

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use super::{Middleware, MiddlewareContext, Next};
use crate::config::RateLimit;
use crate::error::ToolError;
use crate::observability::Metrics;

/// Tracked keys above which expired windows are swept
const SWEEP_THRESHOLD: usize = 1024;

/// Request counters keyed by an arbitrary string
pub struct RateLimiter {
    /// key → (request_count, window_start)
    windows: DashMap<String, (u32, Instant)>,
    limit: RateLimit,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            windows: DashMap::new(),
            limit,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Count a request for `key`
    ///
    /// Returns `Err(retry_after)` once the window's quota is used up.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert((0, now));

        if now.duration_since(entry.1) >= self.limit.window {
            *entry = (0, now);
        }

        if entry.0 >= self.limit.max_requests {
            let elapsed = now.duration_since(entry.1);
            return Err(self.limit.window.saturating_sub(elapsed));
        }

        entry.0 += 1;
        Ok(())
    }

    /// Drop every window that has already expired
    pub fn evict_expired(&self) {
        self.evict_expired_at(Instant::now());
    }

    /// Number of keys currently holding a window
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    // At most one sweep per window length
    fn sweep(&self, now: Instant) {
        {
            let Ok(mut last) = self.last_sweep.lock() else {
                return;
            };
            if now.duration_since(*last) < self.limit.window {
                return;
            }
            *last = now;
        }
        self.evict_expired_at(now);
    }

    fn evict_expired_at(&self, now: Instant) {
        let window = self.limit.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, (_, start)| now.duration_since(*start) < window);
        tracing::debug!(
            evicted = before.saturating_sub(self.windows.len()),
            remaining = self.windows.len(),
            "Evicted expired rate limit windows"
        );
    }

    /// Requests left for `key` in its current window
    pub fn remaining(&self, key: &str) -> u32 {
        match self.windows.get(key) {
            Some(entry) if entry.1.elapsed() < self.limit.window => {
                self.limit.max_requests.saturating_sub(entry.0)
            }
            _ => self.limit.max_requests,
        }
    }
}

/// Rejects calls over the per-client or per-tool quota
///
/// When both quotas apply the most restrictive one wins: a call must fit in
/// both, and a call rejected by the client quota is not counted against the
/// tool quota.
pub struct RateLimitMiddleware {
    per_client: Option<RateLimiter>,
    per_tool: Option<RateLimiter>,
    metrics: Arc<Metrics>,
}

impl RateLimitMiddleware {
    pub fn new(
        per_client: Option<RateLimit>,
        per_tool: Option<RateLimit>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            per_client: per_client.map(RateLimiter::new),
            per_tool: per_tool.map(RateLimiter::new),
            metrics,
        }
    }

    /// `None` when no quota is configured
    pub fn from_limits(
        per_client: Option<RateLimit>,
        per_tool: Option<RateLimit>,
        metrics: Arc<Metrics>,
    ) -> Option<Self> {
        if per_client.is_none() && per_tool.is_none() {
            None
        } else {
            Some(Self::new(per_client, per_tool, metrics))
        }
    }

    fn reject(&self, scope: &str, key: &str, retry_after: Duration) -> ToolError {
        self.metrics.record_rate_limited(scope);
        tracing::debug!(scope, key, retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
        // Round up so clients never retry inside the same window
        let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
        ToolError::rate_limited(&format!("{} '{}'", scope, key), secs.max(1))
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Value, ToolError> {
        if let Some(limiter) = &self.per_client {
            let client = ctx.client().to_string();
            limiter
                .check(&client)
                .map_err(|retry| self.reject("client", &client, retry))?;
        }
        if let Some(limiter) = &self.per_tool {
            let tool = ctx.call.tool.clone();
            limiter
                .check(&tool)
                .map_err(|retry| self.reject("tool", &tool, retry))?;
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(max_requests: u32, secs: u64) -> RateLimit {
        RateLimit {
            max_requests,
            window: Duration::from_secs(secs),
        }
    }

    #[test]
    fn test_allows_under_limit() {
        let limiter = RateLimiter::new(limit(10, 60));
        for _ in 0..10 {
            assert!(limiter.check("a").is_ok());
        }
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(limit(1, 60));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }

    #[test]
    fn test_remaining() {
        let limiter = RateLimiter::new(limit(3, 60));
        assert_eq!(limiter.remaining("a"), 3);
        limiter.check("a").unwrap();
        assert_eq!(limiter.remaining("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = RateLimiter::new(limit(2, 10));
        limiter.check("a").unwrap();
        limiter.check("a").unwrap();

        let retry = limiter.check("a").unwrap_err();
        assert!(retry <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.check("a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_windows_are_evicted() {
        let limiter = RateLimiter::new(limit(1, 60));
        for i in 0..2000 {
            limiter.check(&format!("10.0.{}.{}", i / 256, i % 256)).unwrap();
        }
        assert_eq!(limiter.tracked_keys(), 2000);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.check("10.1.0.1").unwrap();
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_keeps_live_windows() {
        let limiter = RateLimiter::new(limit(5, 10));
        limiter.check("old").unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.check("new").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        limiter.evict_expired();
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.remaining("new"), 4);
    }

    #[test]
    fn test_from_limits_none_when_unconfigured() {
        let metrics = Arc::new(Metrics::new().unwrap());
        assert!(RateLimitMiddleware::from_limits(None, None, metrics.clone()).is_none());
        assert!(RateLimitMiddleware::from_limits(Some(limit(1, 1)), None, metrics).is_some());
    }
}
