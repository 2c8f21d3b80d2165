//! Snapshots exposed for external monitoring.

use crate::domain::CircuitState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Hits over total lookups, 0.0 - 1.0.
    pub hit_rate: f64,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    /// Effective requests per minute after adaptive adjustment.
    pub current_limit: f64,
    pub baseline_limit: f64,
    pub available_tokens: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
}

/// Per resource key view of pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub resource_key: String,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub cache: CacheSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
    pub queue: QueueSnapshot,
}
