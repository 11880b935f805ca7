//! Per-target request budget.
//!
//! Token bucket where each spent token comes back exactly one window after it
//! was spent (sliding-window log). A full burst is allowed, and no 60-second
//! window ever contains more than `capacity` requests.
//!
//! Buckets are keyed by target so concurrent runs against the same target
//! draw from one budget.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use vigil_protocol::TargetId;

pub const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    buckets: Mutex<HashMap<TargetId, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, key: &TargetId, capacity: u32, cost: u32) -> RateDecision {
        self.try_acquire_at(key, capacity, cost, Instant::now())
    }

    /// Take `cost` tokens at `now` if the last window has room for them.
    ///
    /// `capacity` is the caller's per-window limit. Runs with different limits
    /// share the history, and each is held to its own limit against it.
    pub fn try_acquire_at(
        &self,
        key: &TargetId,
        capacity: u32,
        cost: u32,
        now: Instant,
    ) -> RateDecision {
        let cost = cost.max(1);
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let spent = buckets.entry(key.clone()).or_default();

        while let Some(oldest) = spent.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                spent.pop_front();
            } else {
                break;
            }
        }

        let used = spent.len() as u64;
        if cost > capacity || used + u64::from(cost) > u64::from(capacity) {
            // Tokens come back in spend order; wait for enough of them.
            let needed = (used + u64::from(cost)).saturating_sub(u64::from(capacity)) as usize;
            let retry_after = if cost > capacity {
                self.window
            } else {
                spent
                    .get(needed.saturating_sub(1))
                    .map(|at| self.window.saturating_sub(now.saturating_duration_since(*at)))
                    .unwrap_or(self.window)
            };
            return RateDecision::Limited { retry_after };
        }

        for _ in 0..cost {
            spent.push_back(now);
        }
        RateDecision::Allowed {
            remaining: capacity - spent.len() as u32,
        }
    }

    /// Drop buckets with no spend inside the window.
    pub fn prune(&self, now: Instant) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, spent| {
            spent
                .back()
                .is_some_and(|last| now.saturating_duration_since(*last) < self.window)
        });
    }
}
