//! Adaptive throttling on top of the token bucket.
//!
//! Each endpoint tracks an effective requests-per-minute limit that shrinks
//! on upstream 429 responses and grows back after a streak of successes. A
//! new limit only changes the bucket's refill rate from that moment on.

use super::token_bucket::{Acquire, TokenBucketLimiter};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use upstream_guard_core::{Clock, RateLimitConfig, RateLimiterSnapshot};

/// Multiplier applied to the limit on a 429.
pub const SHRINK_FACTOR: f64 = 0.8;
/// Multiplier applied after a success streak.
pub const GROWTH_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointThrottleState {
    pub current_limit: f64,
    pub baseline_limit: f64,
    pub consecutive_429s: u32,
    pub consecutive_successes: u32,
}

impl EndpointThrottleState {
    fn new(baseline_limit: f64) -> Self {
        Self {
            current_limit: baseline_limit,
            baseline_limit,
            consecutive_429s: 0,
            consecutive_successes: 0,
        }
    }
}

/// What an outcome did to an endpoint's limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleUpdate {
    pub previous_limit: f64,
    pub current_limit: f64,
    /// The endpoint has seen enough consecutive 429s that callers should
    /// stop sending to it for a while.
    pub sustained_throttling: bool,
}

impl ThrottleUpdate {
    pub fn changed(&self) -> bool {
        (self.previous_limit - self.current_limit).abs() > f64::EPSILON
    }
}

pub struct AdaptiveThrottle {
    config: RateLimitConfig,
    limiter: TokenBucketLimiter,
    states: DashMap<String, EndpointThrottleState>,
}

impl AdaptiveThrottle {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let limiter =
            TokenBucketLimiter::new(config.burst_limit, config.requests_per_minute, clock);
        Self {
            config,
            limiter,
            states: DashMap::new(),
        }
    }

    /// Take a token for `key` at its current effective rate.
    pub fn try_acquire(&self, key: &str) -> Acquire {
        let limit = self.current_limit(key);
        self.limiter.try_acquire_at_rate(key, limit)
    }

    /// Effective requests per minute for `key`.
    pub fn current_limit(&self, key: &str) -> f64 {
        self.states
            .entry(key.to_string())
            .or_insert_with(|| EndpointThrottleState::new(self.config.requests_per_minute))
            .current_limit
    }

    /// Upstream answered 429.
    pub fn record_throttled(&self, key: &str) -> ThrottleUpdate {
        self.update(key, |state, config| {
            state.consecutive_successes = 0;
            state.consecutive_429s += 1;
            state.current_limit =
                (state.current_limit * SHRINK_FACTOR).max(config.floor_requests_per_minute);
        })
    }

    /// Upstream answered successfully.
    pub fn record_success(&self, key: &str) -> ThrottleUpdate {
        self.update(key, |state, config| {
            state.consecutive_429s = 0;
            state.consecutive_successes += 1;
            if state.consecutive_successes >= config.growth_after_successes {
                state.consecutive_successes = 0;
                state.current_limit = (state.current_limit * GROWTH_FACTOR).min(config.ceiling());
            }
        })
    }

    /// Upstream failed for a reason other than throttling. Breaks the success
    /// streak but leaves the limit alone.
    pub fn record_failure(&self, key: &str) -> ThrottleUpdate {
        self.update(key, |state, _| {
            state.consecutive_successes = 0;
        })
    }

    fn update<F>(&self, key: &str, apply: F) -> ThrottleUpdate
    where
        F: FnOnce(&mut EndpointThrottleState, &RateLimitConfig),
    {
        let mut state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| EndpointThrottleState::new(self.config.requests_per_minute));

        let previous_limit = state.current_limit;
        apply(&mut state, &self.config);

        let update = ThrottleUpdate {
            previous_limit,
            current_limit: state.current_limit,
            sustained_throttling: state.consecutive_429s >= self.config.circuit_breaker_threshold,
        };

        if update.changed() {
            // Applied while the throttle entry is held so rate changes for
            // one key land in order.
            self.limiter.set_rate(key, update.current_limit);
            if update.current_limit < previous_limit {
                warn!(
                    "Throttling {}: limit {:.2} -> {:.2} rpm after {} consecutive 429s",
                    key, previous_limit, update.current_limit, state.consecutive_429s
                );
            } else {
                info!(
                    "Relaxing {}: limit {:.2} -> {:.2} rpm",
                    key, previous_limit, update.current_limit
                );
            }
        } else {
            debug!("Throttle state for {} unchanged at {:.2} rpm", key, state.current_limit);
        }

        update
    }

    /// Copy of the throttle state for `key`, if it exists.
    pub fn state(&self, key: &str) -> Option<EndpointThrottleState> {
        self.states.get(key).map(|s| s.value().clone())
    }

    pub fn snapshot(&self, key: &str) -> RateLimiterSnapshot {
        let (current_limit, baseline_limit) = match self.states.get(key) {
            Some(state) => (state.current_limit, state.baseline_limit),
            None => (self.config.requests_per_minute, self.config.requests_per_minute),
        };
        RateLimiterSnapshot {
            current_limit,
            baseline_limit,
            available_tokens: self.limiter.available_tokens(key),
        }
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }
}
