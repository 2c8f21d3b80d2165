//! Pipeline configuration.
//!
//! Every group deserializes with defaults for missing fields and is checked
//! by [`PipelineConfig::validated`] before a pipeline is constructed.
//! Durations are expressed in milliseconds.

use crate::domain::SchemaHints;
use crate::error::{ConfigError, TransportErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Sizes the token bucket, the adaptive throttle and its breaker trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_rate_limit"))]
pub struct RateLimitConfig {
    /// Baseline sustained rate.
    #[validate(range(min = 0.01, max = 1_000_000.0))]
    pub requests_per_minute: f64,
    /// Bucket capacity.
    #[validate(range(min = 1, max = 100_000))]
    pub burst_limit: u32,
    /// Exponential base for retry backoff.
    #[validate(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,
    /// Consecutive 429 responses that force the endpoint's breaker open.
    #[validate(range(min = 1, max = 1000))]
    pub circuit_breaker_threshold: u32,
    /// Lowest rate the throttle may shrink to.
    #[validate(range(min = 0.01))]
    pub floor_requests_per_minute: f64,
    /// Highest rate the throttle may grow to; defaults to the baseline.
    #[validate(range(min = 0.01))]
    pub ceiling_requests_per_minute: Option<f64>,
    /// Consecutive successes needed before the rate grows.
    #[validate(range(min = 1, max = 10_000))]
    pub growth_after_successes: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 120.0,
            burst_limit: 10,
            backoff_multiplier: 2.0,
            circuit_breaker_threshold: 5,
            floor_requests_per_minute: 6.0,
            ceiling_requests_per_minute: None,
            growth_after_successes: 10,
        }
    }
}

impl RateLimitConfig {
    pub fn ceiling(&self) -> f64 {
        self.ceiling_requests_per_minute
            .unwrap_or(self.requests_per_minute)
    }
}

fn validate_rate_limit(config: &RateLimitConfig) -> Result<(), ValidationError> {
    if config.floor_requests_per_minute > config.requests_per_minute {
        return Err(invalid(
            "rate_floor",
            "floor_requests_per_minute must not exceed requests_per_minute",
        ));
    }
    if config.ceiling() < config.requests_per_minute {
        return Err(invalid(
            "rate_ceiling",
            "ceiling_requests_per_minute must be at least requests_per_minute",
        ));
    }
    Ok(())
}

/// Cache eviction policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least Recently Used - evict the entry with the oldest last access.
    #[default]
    Lru,
    /// Least Frequently Used - evict the entry with the lowest access count.
    Lfu,
    /// First In First Out - evict the oldest insertion.
    Fifo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL per data category.
    pub ttl_ms: HashMap<String, u64>,
    /// TTL for categories without an explicit entry.
    #[validate(range(min = 1))]
    pub default_ttl_ms: u64,
    #[validate(range(min = 1, max = 10_000_000))]
    pub max_cache_size: usize,
    pub cache_strategy: EvictionPolicy,
    /// How long past expiry an entry stays available for stale fallback.
    pub stale_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let ttl_ms = [
            ("realtime", 30_000),
            ("quote", 60_000),
            ("intraday", 300_000),
            ("daily", 3_600_000),
            ("financial", 86_400_000),
            ("basic", 604_800_000),
        ]
        .into_iter()
        .map(|(category, ttl)| (category.to_string(), ttl))
        .collect();

        Self {
            ttl_ms,
            default_ttl_ms: 300_000,
            max_cache_size: 1000,
            cache_strategy: EvictionPolicy::Lru,
            stale_ttl_ms: 86_400_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, category: &str) -> Duration {
        Duration::from_millis(
            self.ttl_ms
                .get(category)
                .copied()
                .unwrap_or(self.default_ttl_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_retry"))]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[validate(range(max = 20))]
    pub max_retries: u32,
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_factor: f64,
    pub retryable_status_codes: Vec<u16>,
    pub retryable_errors: Vec<TransportErrorKind>,
    /// Upper bound for one upstream attempt.
    #[validate(range(min = 1))]
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
            retryable_errors: vec![
                TransportErrorKind::Timeout,
                TransportErrorKind::ConnectionReset,
                TransportErrorKind::ConnectionRefused,
                TransportErrorKind::ConnectionAborted,
                TransportErrorKind::Dns,
            ],
            attempt_timeout_ms: 10_000,
        }
    }
}

fn validate_retry(config: &RetryConfig) -> Result<(), ValidationError> {
    if config.base_delay_ms > config.max_delay_ms {
        return Err(invalid(
            "delay_bounds",
            "base_delay_ms must not exceed max_delay_ms",
        ));
    }
    if config
        .retryable_status_codes
        .iter()
        .any(|code| !(100..=599).contains(code))
    {
        return Err(invalid(
            "status_codes",
            "retryable_status_codes must be HTTP status codes",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside one monitoring window that open the circuit.
    #[validate(range(min = 1, max = 10_000))]
    pub failure_threshold: u32,
    /// Half-open successes that close the circuit.
    #[validate(range(min = 1, max = 10_000))]
    pub success_threshold: u32,
    /// Time spent open before probing again.
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    #[validate(range(min = 1))]
    pub monitoring_window_ms: u64,
    /// Probe calls admitted while half-open.
    #[validate(range(min = 1, max = 10_000))]
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
            monitoring_window_ms: 60_000,
            half_open_max_requests: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct QueueConfig {
    /// Upstream calls in flight at once.
    #[validate(range(min = 1, max = 10_000))]
    pub max_concurrent: usize,
    /// Callers allowed to wait for admission.
    #[validate(range(max = 1_000_000))]
    pub max_queue_size: usize,
    /// Number of distinct priorities; valid priorities are `0..priority_levels`.
    #[validate(range(min = 1))]
    pub priority_levels: u8,
    #[validate(range(min = 1))]
    pub queue_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 100,
            priority_levels: 3,
            queue_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DataCompletionConfig {
    /// Serve stale cache entries instead of failing.
    pub enable_fallback: bool,
    /// Largest priority value still eligible for stale fallback.
    pub fallback_priority: u8,
    /// Insert `null` for missing expected fields.
    pub fill_missing_fields: bool,
    /// Reject payloads scoring below `min_completeness_score`.
    pub validate_completeness: bool,
    #[validate(range(max = 100))]
    pub min_completeness_score: u8,
    /// Quality schema per data category.
    pub schemas: HashMap<String, SchemaHints>,
}

impl Default for DataCompletionConfig {
    fn default() -> Self {
        let ohlcv = SchemaHints::new()
            .critical(["close"])
            .important(["open", "high", "low"])
            .standard(["volume", "amount"]);
        let quote = SchemaHints::new()
            .critical(["price"])
            .important(["volume"])
            .standard(["high", "low", "open"]);

        let schemas = [
            ("daily".to_string(), ohlcv.clone()),
            ("intraday".to_string(), ohlcv),
            ("quote".to_string(), quote.clone()),
            ("realtime".to_string(), quote),
        ]
        .into_iter()
        .collect();

        Self {
            enable_fallback: true,
            fallback_priority: u8::MAX,
            fill_missing_fields: false,
            validate_completeness: false,
            min_completeness_score: 50,
            schemas,
        }
    }
}

impl DataCompletionConfig {
    pub fn schema_for(&self, category: &str) -> Option<&SchemaHints> {
        self.schemas.get(category)
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    #[validate(nested)]
    pub rate_limit: RateLimitConfig,
    #[validate(nested)]
    pub cache: CacheConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[validate(nested)]
    pub queue: QueueConfig,
    #[validate(nested)]
    pub data_completion: DataCompletionConfig,
}

impl PipelineConfig {
    /// Checks every documented bound, returning the config unchanged on success.
    pub fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}
