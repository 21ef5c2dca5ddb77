// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Fixed-window rate limiter over a shared counter store.
//!
//! The limiter is a stateless decision function: every window lives in
//! the store's TTL mechanism, so any number of replicas sharing one
//! store enforce one consistent global limit. Per check it performs one
//! atomic increment (and at most one expiry-set) against the store and
//! nothing else.

use crate::config::RateLimitConfig;
use crate::store::{CounterStore, StoreError};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome classification of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Counted and under the limit
    Allowed,
    /// Counted and over the limit
    Limited,
    /// Store unreachable, admitted per fail-open policy
    FailedOpen,
    /// Store unreachable, rejected per fail-closed policy
    FailedClosed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Limited => "limited",
            Self::FailedOpen => "failed_open",
            Self::FailedClosed => "failed_closed",
        }
    }
}

/// Per-request rate limit decision. Transient; never persisted.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the current window expires
    pub reset_at: DateTime<Utc>,
    /// How this decision was reached
    pub outcome: Outcome,
}

impl Decision {
    /// Seconds until the window resets, rounded up. Zero-floored so a
    /// stale clock never produces a negative Retry-After.
    pub fn retry_after_secs(&self) -> u64 {
        let ms = (self.reset_at - Utc::now()).num_milliseconds().max(0) as u64;
        ms.div_ceil(1000)
    }
}

/// Fixed-window rate limiter.
///
/// Cheap to share: holds the immutable policy and a store handle, no
/// mutable state and no locks. Checks for distinct client keys proceed
/// fully in parallel; same-key checks serialize only at the store's
/// atomic increment.
pub struct RateLimiter {
    policy: RateLimitConfig,
    key_prefix: String,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Create a limiter enforcing `policy` against `store`, namespacing
    /// counter keys with `key_prefix`.
    pub fn new(
        policy: RateLimitConfig,
        key_prefix: impl Into<String>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            policy,
            key_prefix: key_prefix.into(),
            store,
        }
    }

    /// Decide whether the request identified by `client_key` may
    /// proceed. Never fails: store errors are resolved here per the
    /// fail-open flag and never reach the caller.
    pub async fn check(&self, client_key: &str) -> Decision {
        let key = format!("{}{}", self.key_prefix, client_key);
        let window = self.policy.window_duration();

        match self.store.incr(&key, window).await {
            Ok(state) => {
                let reset_at = Utc::now() + to_delta(state.ttl);
                let max = u64::from(self.policy.max_requests);

                if state.count <= max {
                    debug!(key = %key, count = state.count, "Request allowed");
                    Decision {
                        allowed: true,
                        remaining: (max - state.count) as u32,
                        reset_at,
                        outcome: Outcome::Allowed,
                    }
                } else {
                    debug!(key = %key, count = state.count, "Request over limit");
                    Decision {
                        allowed: false,
                        remaining: 0,
                        reset_at,
                        outcome: Outcome::Limited,
                    }
                }
            }
            Err(StoreError::Unavailable(reason)) => self.degraded_decision(&key, &reason),
        }
    }

    /// Resolve a store outage. The rejection path is indistinguishable
    /// from a genuine limit breach at the HTTP layer, so topology is
    /// not leaked to clients.
    fn degraded_decision(&self, key: &str, reason: &str) -> Decision {
        let reset_at = Utc::now() + to_delta(self.policy.window_duration());
        if self.policy.fail_open {
            warn!(key = %key, error = %reason, "Counter store unavailable, failing open");
            Decision {
                allowed: true,
                remaining: self.policy.max_requests.saturating_sub(1),
                reset_at,
                outcome: Outcome::FailedOpen,
            }
        } else {
            warn!(key = %key, error = %reason, "Counter store unavailable, failing closed");
            Decision {
                allowed: false,
                remaining: 0,
                reset_at,
                outcome: Outcome::FailedClosed,
            }
        }
    }

    /// Configured maximum requests per window.
    pub fn limit(&self) -> u32 {
        self.policy.max_requests
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or_else(|_| TimeDelta::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WindowState};
    use async_trait::async_trait;

    /// Store stub that is always down.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn incr(&self, _key: &str, _window: Duration) -> Result<WindowState, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn policy(max: u32, window_ms: u64, fail_open: bool) -> RateLimitConfig {
        RateLimitConfig {
            window_ms,
            max_requests: max,
            fail_open,
            ..Default::default()
        }
    }

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new(policy(max, 60_000, false), "rl:", Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_allows_up_to_max() {
        let limiter = limiter(3);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.check("10.0.0.1").await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.outcome, Outcome::Allowed);
        }
    }

    #[tokio::test]
    async fn test_boundary_is_inclusive() {
        let limiter = limiter(1);

        // Exactly max-th request is still allowed
        let decision = limiter.check("10.0.0.1").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);

        let decision = limiter.check("10.0.0.1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.outcome, Outcome::Limited);
    }

    #[tokio::test]
    async fn test_reject_reports_zero_remaining_and_reset() {
        let limiter = limiter(2);
        limiter.check("k").await;
        limiter.check("k").await;

        let decision = limiter.check("k").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_at > Utc::now());
        assert!(decision.retry_after_secs() <= 60);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_interact() {
        let limiter = limiter(1);

        assert!(limiter.check("1.1.1.1").await.allowed);
        assert!(!limiter.check("1.1.1.1").await.allowed);
        assert!(limiter.check("2.2.2.2").await.allowed);
    }

    #[tokio::test]
    async fn test_outage_fails_closed_by_default() {
        let limiter = RateLimiter::new(policy(100, 60_000, false), "rl:", Arc::new(DownStore));

        let decision = limiter.check("10.0.0.1").await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.outcome, Outcome::FailedClosed);
    }

    #[tokio::test]
    async fn test_outage_fails_open_when_configured() {
        let limiter = RateLimiter::new(policy(100, 60_000, true), "rl:", Arc::new(DownStore));

        let decision = limiter.check("10.0.0.1").await;
        assert!(decision.allowed);
        assert_eq!(decision.outcome, Outcome::FailedOpen);
    }

    #[tokio::test]
    async fn test_window_reset_starts_fresh_count() {
        let limiter = RateLimiter::new(
            policy(2, 30, false),
            "rl:",
            Arc::new(MemoryStore::new()),
        );

        limiter.check("k").await;
        limiter.check("k").await;
        assert!(!limiter.check("k").await.allowed);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let decision = limiter.check("k").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1, "counter must restart at 1");
    }
}
