//! Per-endpoint token bucket.
//!
//! Buckets refill lazily: every acquisition first credits
//! `elapsed_ms * refill_rate_per_ms` tokens (capped at the burst size), then
//! tests for a whole token. There is no background refill task.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use upstream_guard_core::Clock;

/// Slack for float accumulation when testing for a whole token.
const TOKEN_EPSILON: f64 = 1e-9;

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    pub granted: bool,
    /// Zero when granted, otherwise time until the next whole token.
    pub retry_after_ms: u64,
}

impl Acquire {
    fn granted() -> Self {
        Self {
            granted: true,
            retry_after_ms: 0,
        }
    }

    fn denied(retry_after_ms: u64) -> Self {
        Self {
            granted: false,
            retry_after_ms,
        }
    }
}

/// Token bucket state for one endpoint key
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    tokens: f64,
    max_tokens: f64,
    refill_rate_per_ms: f64,
    last_refill_at: Instant,
}

impl TokenBucketState {
    /// A full bucket.
    pub fn new(max_tokens: f64, requests_per_minute: f64, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate_per_ms: per_ms(requests_per_minute),
            last_refill_at: now,
        }
    }

    /// Credit tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill_at).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_rate_per_ms).min(self.max_tokens);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
    }

    /// Try to consume a token
    pub fn try_consume(&mut self, now: Instant) -> Acquire {
        self.refill(now);

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Acquire::granted()
        } else {
            Acquire::denied(self.retry_after_ms())
        }
    }

    /// Change the refill rate. Tokens accrued so far are credited at the old
    /// rate first, so the change only affects future refills.
    pub fn set_rate(&mut self, requests_per_minute: f64, now: Instant) {
        self.refill(now);
        self.refill_rate_per_ms = per_ms(requests_per_minute);
    }

    /// Time until a whole token is available.
    pub fn retry_after_ms(&self) -> u64 {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            return 0;
        }
        let needed = 1.0 - self.tokens;
        (((needed / self.refill_rate_per_ms) - TOKEN_EPSILON).ceil() as u64).max(1)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_rate_per_ms(&self) -> f64 {
        self.refill_rate_per_ms
    }

    pub fn requests_per_minute(&self) -> f64 {
        self.refill_rate_per_ms * 60_000.0
    }
}

fn per_ms(requests_per_minute: f64) -> f64 {
    requests_per_minute / 60_000.0
}

/// Rate limiter keeping one token bucket per endpoint key.
///
/// Each key's bucket is mutated under its map entry lock, so concurrent
/// callers on the same key are serialized while distinct keys proceed in
/// parallel.
pub struct TokenBucketLimiter {
    burst_limit: f64,
    default_requests_per_minute: f64,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, TokenBucketState>,
}

impl TokenBucketLimiter {
    pub fn new(burst_limit: u32, requests_per_minute: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            burst_limit: burst_limit as f64,
            default_requests_per_minute: requests_per_minute,
            clock,
            buckets: DashMap::new(),
        }
    }

    /// Take a token for `key` at the default rate.
    pub fn try_acquire(&self, key: &str) -> Acquire {
        self.try_acquire_at_rate(key, self.default_requests_per_minute)
    }

    /// Take a token for `key`, creating its bucket at `requests_per_minute`
    /// if this is the first reference to the key.
    pub fn try_acquire_at_rate(&self, key: &str, requests_per_minute: f64) -> Acquire {
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucketState::new(self.burst_limit, requests_per_minute, now));

        let result = bucket.try_consume(now);
        if !result.granted {
            debug!(
                "Rate limiter denied {}: retry after {}ms",
                key, result.retry_after_ms
            );
        }
        result
    }

    /// Change the refill rate for `key`.
    pub fn set_rate(&self, key: &str, requests_per_minute: f64) {
        let now = self.clock.now();
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucketState::new(self.burst_limit, requests_per_minute, now))
            .set_rate(requests_per_minute, now);
    }

    /// Tokens currently available for `key`, refilled to now without
    /// consuming anything. Unknown keys report a full bucket.
    pub fn available_tokens(&self, key: &str) -> f64 {
        let now = self.clock.now();
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                bucket.refill(now);
                bucket.tokens()
            }
            None => self.burst_limit,
        }
    }

    /// Copy of the bucket state for `key`, if it exists.
    pub fn bucket(&self, key: &str) -> Option<TokenBucketState> {
        self.buckets.get(key).map(|b| b.value().clone())
    }

    /// Number of buckets created so far (for monitoring)
    pub fn active_buckets(&self) -> usize {
        self.buckets.len()
    }
}
