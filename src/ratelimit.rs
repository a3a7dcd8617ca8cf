//! Fixed-window rate limiting
//!
//! One atomic counter per (endpoint class, identity); the first increment
//! of a window starts its expiry clock. Checks never read-then-write, so
//! concurrent requests cannot slip past the limit. When the counter backend
//! is unreachable the limiter denies (fail-closed) unless the operator has
//! explicitly flipped the toggle.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::{with_timeout, Cache};
use crate::config::{RateLimits, RateWindow};

/// Endpoint classes with independent windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Query,
    Feedback,
    Ticket,
    Default,
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointClass::Query => "query",
            EndpointClass::Feedback => "feedback",
            EndpointClass::Ticket => "ticket",
            EndpointClass::Default => "default",
        };
        f.write_str(s)
    }
}

/// Outcome of a rate-limit check, also the source for response headers
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_s: i64,
    pub reset_in_seconds: u64,
}

impl RateDecision {
    fn denied(limit: u32, reset_in: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_epoch_s: Utc::now().timestamp() + reset_in.as_secs() as i64,
            reset_in_seconds: reset_in.as_secs(),
        }
    }
}

/// Select the rate-limit identity: authenticated agent id, then email,
/// then the request source address.
pub fn select_identity(agent_id: Option<&str>, email: Option<&str>, source_addr: &str) -> String {
    agent_id
        .filter(|s| !s.is_empty())
        .or(email.filter(|s| !s.is_empty()))
        .unwrap_or(source_addr)
        .to_string()
}

/// Fixed-window limiter over the cache backend
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    limits: RateLimits,
    cache_timeout: Duration,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, limits: RateLimits, cache_timeout: Duration) -> Self {
        Self { cache, limits, cache_timeout }
    }

    fn window(&self, class: EndpointClass) -> RateWindow {
        match class {
            EndpointClass::Query => self.limits.query,
            EndpointClass::Feedback => self.limits.feedback,
            EndpointClass::Ticket => self.limits.ticket,
            EndpointClass::Default => self.limits.default,
        }
    }

    /// Count this request against the identity's window and decide.
    pub async fn check(&self, identity: &str, class: EndpointClass) -> RateDecision {
        let window = self.window(class);
        let key = format!("ratelimit:{class}:{identity}");

        let result = with_timeout(
            "cache",
            self.cache_timeout,
            self.cache.incr_with_ttl(&key, window.window),
        )
        .await;

        match result {
            Ok((count, reset_in)) => {
                let allowed = count <= window.limit as i64;
                if !allowed {
                    tracing::warn!(identity, class = %class, count, "rate limit exceeded");
                    return RateDecision::denied(window.limit, reset_in);
                }
                let remaining = (window.limit as i64 - count).max(0) as u32;
                RateDecision {
                    allowed: true,
                    limit: window.limit,
                    remaining,
                    reset_epoch_s: Utc::now().timestamp() + reset_in.as_secs() as i64,
                    reset_in_seconds: reset_in.as_secs(),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "rate-limit backend unreachable");
                if self.limits.fail_closed {
                    RateDecision::denied(window.limit, window.window)
                } else {
                    RateDecision {
                        allowed: true,
                        limit: window.limit,
                        remaining: 0,
                        reset_epoch_s: Utc::now().timestamp() + window.window.as_secs() as i64,
                        reset_in_seconds: window.window.as_secs(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemoryCache;
    use crate::error::Result;
    use async_trait::async_trait;

    fn limiter(limits: RateLimits) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCache::new()), limits, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_limit_boundary() {
        let mut limits = RateLimits::default();
        limits.query.limit = 3;
        let limiter = limiter(limits);

        for i in 0..3 {
            let decision = limiter.check("agent-9", EndpointClass::Query).await;
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, 2 - i);
        }
        let denied = limiter.check("agent-9", EndpointClass::Query).await;
        assert!(!denied.allowed);
        assert_eq!(denied.limit, 3);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_in_seconds > 0);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let mut limits = RateLimits::default();
        limits.query.limit = 1;
        let limiter = limiter(limits);

        assert!(limiter.check("a", EndpointClass::Query).await.allowed);
        assert!(!limiter.check("a", EndpointClass::Query).await.allowed);
        assert!(limiter.check("b", EndpointClass::Query).await.allowed);
    }

    #[tokio::test]
    async fn test_classes_are_independent() {
        let mut limits = RateLimits::default();
        limits.ticket.limit = 1;
        let limiter = limiter(limits);

        assert!(limiter.check("a", EndpointClass::Ticket).await.allowed);
        assert!(!limiter.check("a", EndpointClass::Ticket).await.allowed);
        assert!(limiter.check("a", EndpointClass::Query).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_closed_on_backend_outage() {
        struct BrokenCache;
        #[async_trait]
        impl Cache for BrokenCache {
            async fn push_recent(&self, _: &str, _: String, _: usize, _: Duration) -> Result<()> {
                Err(crate::error::Error::Other("down".into()))
            }
            async fn recent(&self, _: &str, _: usize) -> Result<Vec<String>> {
                Err(crate::error::Error::Other("down".into()))
            }
            async fn get(&self, _: &str) -> Result<Option<String>> {
                Err(crate::error::Error::Other("down".into()))
            }
            async fn set_with_ttl(&self, _: &str, _: String, _: Duration) -> Result<()> {
                Err(crate::error::Error::Other("down".into()))
            }
            async fn incr_with_ttl(&self, _: &str, _: Duration) -> Result<(i64, Duration)> {
                Err(crate::error::Error::Other("down".into()))
            }
            async fn delete(&self, _: &str) -> Result<()> {
                Err(crate::error::Error::Other("down".into()))
            }
        }

        let closed = RateLimiter::new(
            Arc::new(BrokenCache),
            RateLimits::default(),
            Duration::from_millis(50),
        );
        assert!(!closed.check("a", EndpointClass::Query).await.allowed);

        let mut open_limits = RateLimits::default();
        open_limits.fail_closed = false;
        let open = RateLimiter::new(
            Arc::new(BrokenCache),
            open_limits,
            Duration::from_millis(50),
        );
        assert!(open.check("a", EndpointClass::Query).await.allowed);
    }

    #[test]
    fn test_identity_selection_order() {
        assert_eq!(select_identity(Some("agent-9"), Some("a@b.c"), "1.2.3.4"), "agent-9");
        assert_eq!(select_identity(None, Some("a@b.c"), "1.2.3.4"), "a@b.c");
        assert_eq!(select_identity(Some(""), None, "1.2.3.4"), "1.2.3.4");
    }
}
