//! Adaptive per-key rate limiting.
//!
//! # Algorithm
//! One fixed window per key. At rollover the budget for the next window is
//! derived from the previous one:
//! - rejection ratio ≥ 25% → budget shrinks by 20%
//! - no rejections and utilization ≤ 50% → budget grows by 20%
//! - otherwise unchanged
//!
//! The budget always stays within `[max(1, baseline / 2), baseline × 3]`.
//!
//! # Design Decisions
//! - Policy-agnostic: window size and baseline arrive with every check
//! - State lives in a sharded map; a check locks a single entry
//! - Rejected requests never consume budget
//! - Window counters are in cost units so the rejection ratio compares like
//!   with like; the lifetime `checks`/`rejections` stats count calls

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::{RateLimitConfig, RouteRateLimit};

/// Budget change applied per window, in percent.
pub const ADAPTIVE_STEP_PERCENT: u32 = 20;
/// Rejection ratio at or above which the budget shrinks.
pub const SHRINK_REJECTION_RATIO: f64 = 0.25;
/// Utilization at or below which a rejection-free window grows the budget.
pub const GROW_UTILIZATION_RATIO: f64 = 0.5;
/// Lower clamp as a fraction of the baseline.
pub const FLOOR_RATIO: f64 = 0.5;
/// Upper clamp as a multiple of the baseline.
pub const CEILING_RATIO: f64 = 3.0;

/// Window size and baseline budget for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub baseline: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(baseline: u32, window: Duration) -> Self {
        Self {
            baseline: baseline.max(1),
            window,
        }
    }

    fn floor(&self) -> u32 {
        ((self.baseline as f64 * FLOOR_RATIO) as u32).max(1)
    }

    fn ceiling(&self) -> u32 {
        ((self.baseline as f64 * CEILING_RATIO) as u32).max(self.baseline)
    }
}

impl From<RouteRateLimit> for RateLimitPolicy {
    fn from(limit: RouteRateLimit) -> Self {
        Self::new(limit.requests, Duration::from_millis(limit.window_ms))
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Budget of the current window.
    pub limit: u32,
    pub remaining: u32,
    /// Time until the current window rolls over.
    pub reset_after: Duration,
    /// Wall-clock instant of the rollover.
    pub reset_at: SystemTime,
}

impl RateLimitDecision {
    /// Rollover time as Unix seconds, rounded up.
    pub fn reset_at_unix_secs(&self) -> u64 {
        let since = self
            .reset_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        since.as_secs() + u64::from(since.subsec_nanos() > 0)
    }

    /// `Retry-After` value in whole seconds (at least 1).
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_after.as_secs_f64().ceil().max(1.0) as u64
    }
}

/// Per-key window state.
#[derive(Debug, Clone)]
struct WindowState {
    window_start: Instant,
    window_size: Duration,
    baseline: u32,
    /// Admitted cost units.
    request_count: u32,
    /// Rejected cost units.
    rejected: u32,
    adaptive_budget: u32,
    last_seen: Instant,
}

impl WindowState {
    fn new(policy: RateLimitPolicy, now: Instant) -> Self {
        Self {
            window_start: now,
            window_size: policy.window,
            baseline: policy.baseline,
            request_count: 0,
            rejected: 0,
            adaptive_budget: policy.baseline,
            last_seen: now,
        }
    }

    /// Roll the window over, deriving the next budget from the one ending.
    fn roll(&mut self, policy: RateLimitPolicy, now: Instant) {
        self.adaptive_budget = next_budget(
            self.adaptive_budget,
            self.request_count,
            self.rejected,
            policy,
        );
        self.window_start = now;
        self.request_count = 0;
        self.rejected = 0;
    }
}

/// Budget for the next window given the outcome of the one ending.
pub fn next_budget(budget: u32, accepted: u32, rejected: u32, policy: RateLimitPolicy) -> u32 {
    let attempts = accepted.saturating_add(rejected);
    let step = (budget.saturating_mul(ADAPTIVE_STEP_PERCENT) / 100).max(1);

    let scaled = if attempts > 0 && rejected as f64 / attempts as f64 >= SHRINK_REJECTION_RATIO {
        budget.saturating_sub(step)
    } else if rejected == 0 && accepted as f64 <= budget as f64 * GROW_UTILIZATION_RATIO {
        budget.saturating_add(step)
    } else {
        budget
    };

    scaled.clamp(policy.floor(), policy.ceiling())
}

/// Counters surfaced through health and stats.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimiterStats {
    pub active_keys: usize,
    pub checks: u64,
    pub rejections: u64,
}

/// Snapshot of one key's window.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub key: String,
    pub request_count: u32,
    pub adaptive_budget: u32,
    pub baseline: u32,
    pub window_ms: u64,
}

/// Adaptive rate limiter shared by all in-flight requests.
pub struct AdaptiveRateLimiter {
    states: DashMap<String, WindowState>,
    default_policy: RateLimitPolicy,
    idle_ttl: Duration,
    checks: AtomicU64,
    rejections: AtomicU64,
}

impl AdaptiveRateLimiter {
    pub fn new(default_policy: RateLimitPolicy, idle_ttl: Duration) -> Self {
        Self {
            states: DashMap::new(),
            default_policy,
            idle_ttl,
            checks: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            RateLimitPolicy::new(config.requests, Duration::from_millis(config.window_ms)),
            Duration::from_secs(config.idle_ttl_secs),
        )
    }

    /// Policy used when a route declares none.
    pub fn default_policy(&self) -> RateLimitPolicy {
        self.default_policy
    }

    /// Check and, if admitted, consume `cost` units for `key`.
    pub fn check(&self, key: &str, cost: u32, policy: RateLimitPolicy) -> RateLimitDecision {
        self.check_at(key, cost, policy, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(
        &self,
        key: &str,
        cost: u32,
        policy: RateLimitPolicy,
        now: Instant,
    ) -> RateLimitDecision {
        let cost = cost.max(1);
        self.checks.fetch_add(1, Ordering::Relaxed);

        let mut entry = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| WindowState::new(policy, now));
        let state = entry.value_mut();

        if state.baseline != policy.baseline || state.window_size != policy.window {
            *state = WindowState {
                window_start: state.window_start,
                request_count: state.request_count,
                ..WindowState::new(policy, now)
            };
        }

        if now.saturating_duration_since(state.window_start) >= state.window_size {
            state.roll(policy, now);
        }
        state.last_seen = now;

        let allowed = state.request_count.saturating_add(cost) <= state.adaptive_budget;
        if allowed {
            state.request_count += cost;
        } else {
            state.rejected = state.rejected.saturating_add(cost);
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }

        let elapsed = now.saturating_duration_since(state.window_start);
        let reset_after = state.window_size.saturating_sub(elapsed);

        RateLimitDecision {
            allowed,
            limit: state.adaptive_budget,
            remaining: state.adaptive_budget.saturating_sub(state.request_count),
            reset_after,
            reset_at: SystemTime::now() + reset_after,
        }
    }

    /// Drop keys idle for longer than the configured TTL.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.states.len();
        self.states
            .retain(|_, state| now.saturating_duration_since(state.last_seen) <= self.idle_ttl);
        let evicted = before.saturating_sub(self.states.len());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.states.len(), "Evicted idle rate limit keys");
        }
        evicted
    }

    pub fn active_keys(&self) -> usize {
        self.states.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            active_keys: self.states.len(),
            checks: self.checks.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the busiest keys, by current request count.
    pub fn top_keys(&self, limit: usize) -> Vec<KeySnapshot> {
        let mut keys: Vec<KeySnapshot> = self
            .states
            .iter()
            .map(|r| KeySnapshot {
                key: r.key().clone(),
                request_count: r.request_count,
                adaptive_budget: r.adaptive_budget,
                baseline: r.baseline,
                window_ms: r.window_size.as_millis() as u64,
            })
            .collect();
        keys.sort_by(|a, b| b.request_count.cmp(&a.request_count).then(a.key.cmp(&b.key)));
        keys.truncate(limit);
        keys
    }
}
