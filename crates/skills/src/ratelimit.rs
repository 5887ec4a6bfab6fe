//! Sliding-window rate limiting keyed by `(scope, principal)`.
//!
//! The window is a pruned `VecDeque` of hit timestamps. The store is
//! in-memory and infallible; callers that consult a fallible backing store
//! must fail open (availability over strict quota, per policy).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cg_domain::config::RateLimitPolicy;

/// The outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// When denied: seconds until the oldest in-window hit ages out.
    pub retry_after_seconds: u64,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }
}

pub struct RateLimiter {
    windows: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record one request for `(scope, principal)` under `policy`.
    /// An allowed check counts against the window; a denied one does not.
    pub fn check(&self, scope: &str, principal: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let now = Instant::now();
        let window = Duration::from_secs(policy.window_seconds);

        let mut windows = self.windows.lock();
        let hits = windows
            .entry((scope.to_owned(), principal.to_owned()))
            .or_default();

        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if (hits.len() as u32) < policy.max_requests {
            hits.push_back(now);
            return RateLimitDecision::allowed();
        }

        let oldest = hits.front().copied().unwrap_or(now);
        let elapsed = now.duration_since(oldest);
        let remaining = window.saturating_sub(elapsed);
        RateLimitDecision {
            allowed: false,
            // Round up so "retry after N" is never early.
            retry_after_seconds: remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0),
        }
    }

    /// Drop windows with no in-window hits (periodic housekeeping).
    pub fn prune(&self, max_window: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.retain(|_, hits| {
            hits.iter().any(|t| now.duration_since(*t) < max_window)
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
