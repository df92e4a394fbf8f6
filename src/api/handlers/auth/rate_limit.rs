//! Rate limiting for the auth and barcode surfaces.
//!
//! Sliding-window counters keyed on `(scope, key)`. Per-username scopes key
//! on the submitted username so exhausting one account cannot lock another;
//! everything else keys on the authenticated user id or the remote IP.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Anon,
    User,
    Login,
    LoginUsername,
    Registration,
    BarcodeGeneration,
    BarcodeManagement,
    UserProfile,
    AdminLogin,
}

impl Scope {
    /// `(max requests, window)` per scope.
    #[must_use]
    pub fn limit(self) -> (usize, Duration) {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * 60;
        const DAY: u64 = 24 * 60 * 60;
        match self {
            Self::Anon => (100, Duration::from_secs(DAY)),
            Self::User => (1000, Duration::from_secs(DAY)),
            Self::Login => (5, Duration::from_secs(MINUTE)),
            Self::LoginUsername | Self::AdminLogin => (5, Duration::from_secs(15 * MINUTE)),
            Self::Registration => (5, Duration::from_secs(DAY)),
            Self::BarcodeGeneration => (100, Duration::from_secs(HOUR)),
            Self::BarcodeManagement => (50, Duration::from_secs(HOUR)),
            Self::UserProfile => (20, Duration::from_secs(HOUR)),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anon => "anon",
            Self::User => "user",
            Self::Login => "login",
            Self::LoginUsername => "login_username",
            Self::Registration => "registration",
            Self::BarcodeGeneration => "barcode_generation",
            Self::BarcodeManagement => "barcode_management",
            Self::UserProfile => "user_profile",
            Self::AdminLogin => "admin_login",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, scope: Scope, key: &str) -> Decision;
}

/// In-process sliding window. Each `(scope, key)` pair owns a queue of
/// request instants; stale entries are dropped on access.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    buckets: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(&self, scope: Scope, key: &str) -> Decision {
        let (max_requests, window) = scope.limit();
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(format!("{}:{key}", scope.as_str()))
            .or_default();

        while let Some(first) = bucket.front() {
            if now.duration_since(*first) > window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= max_requests {
            let retry_after = bucket
                .front()
                .map_or(window, |first| window.saturating_sub(now.duration_since(*first)));
            return Decision::Limited {
                retry_after_secs: retry_after.as_secs().max(1),
            };
        }

        bucket.push_back(now);
        Decision::Allowed
    }
}

/// Limiter that allows everything; used in tests.
#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _scope: Scope, _key: &str) -> Decision {
        Decision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_rates_match_the_policy_table() {
        assert_eq!(Scope::Anon.limit(), (100, Duration::from_secs(86_400)));
        assert_eq!(Scope::User.limit(), (1000, Duration::from_secs(86_400)));
        assert_eq!(Scope::Login.limit(), (5, Duration::from_secs(60)));
        assert_eq!(Scope::LoginUsername.limit(), (5, Duration::from_secs(900)));
        assert_eq!(Scope::Registration.limit(), (5, Duration::from_secs(86_400)));
        assert_eq!(
            Scope::BarcodeGeneration.limit(),
            (100, Duration::from_secs(3600))
        );
        assert_eq!(
            Scope::BarcodeManagement.limit(),
            (50, Duration::from_secs(3600))
        );
        assert_eq!(Scope::UserProfile.limit(), (20, Duration::from_secs(3600)));
        assert_eq!(Scope::AdminLogin.limit(), (5, Duration::from_secs(900)));
    }

    #[test]
    fn sixth_login_attempt_is_limited() {
        let limiter = SlidingWindowLimiter::new();
        for _ in 0..5 {
            assert_eq!(limiter.check(Scope::Login, "10.0.0.1"), Decision::Allowed);
        }
        assert!(matches!(
            limiter.check(Scope::Login, "10.0.0.1"),
            Decision::Limited { .. }
        ));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindowLimiter::new();
        for _ in 0..5 {
            limiter.check(Scope::LoginUsername, "alice");
        }
        assert!(matches!(
            limiter.check(Scope::LoginUsername, "alice"),
            Decision::Limited { .. }
        ));
        // A different username is untouched by alice's exhaustion.
        assert_eq!(
            limiter.check(Scope::LoginUsername, "bob"),
            Decision::Allowed
        );
    }

    #[test]
    fn scopes_are_independent_for_the_same_key() {
        let limiter = SlidingWindowLimiter::new();
        for _ in 0..5 {
            limiter.check(Scope::Login, "10.0.0.1");
        }
        assert!(matches!(
            limiter.check(Scope::Login, "10.0.0.1"),
            Decision::Limited { .. }
        ));
        assert_eq!(limiter.check(Scope::Anon, "10.0.0.1"), Decision::Allowed);
    }

    #[test]
    fn retry_after_is_within_the_window() {
        let limiter = SlidingWindowLimiter::new();
        for _ in 0..5 {
            limiter.check(Scope::Login, "10.0.0.1");
        }
        if let Decision::Limited { retry_after_secs } = limiter.check(Scope::Login, "10.0.0.1") {
            assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
        } else {
            panic!("expected limited decision");
        }
    }

    #[test]
    fn noop_limiter_allows() {
        let limiter = NoopRateLimiter;
        assert_eq!(limiter.check(Scope::Login, "10.0.0.1"), Decision::Allowed);
    }
}
