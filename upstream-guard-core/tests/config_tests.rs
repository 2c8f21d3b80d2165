use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use serde_json::json;
use std::time::Duration;
use upstream_guard_core::{
    CacheConfig, DataCompletionConfig, EvictionPolicy, PipelineConfig, PipelineError,
    QualityReport, RateLimitConfig, RetryConfig, SourceReliability, TransportErrorKind,
};
use validator::Validate;

// ===== Defaults =====

#[test]
fn test_defaults_match_documented_values() {
    let config = PipelineConfig::default();

    assert_eq!(config.rate_limit.requests_per_minute, 120.0);
    assert_eq!(config.rate_limit.burst_limit, 10);
    assert_eq!(config.rate_limit.backoff_multiplier, 2.0);
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(config.retry.retryable_status_codes, vec![408, 429, 500, 502, 503, 504]);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.circuit_breaker.success_threshold, 2);
    assert_eq!(config.queue.max_concurrent, 5);
    assert_eq!(config.cache.cache_strategy, EvictionPolicy::Lru);
    assert!(config.data_completion.enable_fallback);
    assert!(!config.data_completion.validate_completeness);
}

#[rstest]
#[case("realtime", 30)]
#[case("quote", 60)]
#[case("intraday", 300)]
#[case("daily", 3_600)]
#[case("financial", 86_400)]
#[case("basic", 604_800)]
#[case("something-else", 300)]
fn test_ttl_per_category(#[case] category: &str, #[case] seconds: u64) {
    let cache = CacheConfig::default();
    assert_eq!(cache.ttl_for(category), Duration::from_secs(seconds));
}

#[test]
fn test_default_schemas() {
    let config = DataCompletionConfig::default();
    let daily = config.schema_for("daily").unwrap();
    assert_eq!(daily.critical, vec!["close".to_string()]);
    assert_eq!(daily.total_weight(), 2.0 + 3.0 * 1.5 + 2.0);
    assert!(config.schema_for("financial").is_none());
}

// ===== Deserialization =====

#[test]
fn test_partial_json_keeps_defaults() {
    let config: PipelineConfig = serde_json::from_value(json!({
        "rate_limit": {"requests_per_minute": 30.0, "floor_requests_per_minute": 3.0},
        "cache": {"cache_strategy": "lfu", "ttl_ms": {"quote": 5000}},
        "retry": {"retryable_errors": ["timeout", "dns"]},
        "data_completion": {
            "schemas": {"fund": {"critical": ["nav"], "standard": ["date"]}}
        }
    }))
    .unwrap();

    assert_eq!(config.rate_limit.requests_per_minute, 30.0);
    assert_eq!(config.rate_limit.burst_limit, 10);
    assert_eq!(config.cache.cache_strategy, EvictionPolicy::Lfu);
    assert_eq!(config.cache.ttl_for("quote"), Duration::from_secs(5));
    assert_eq!(config.cache.ttl_for("daily"), Duration::from_secs(300));
    assert_eq!(
        config.retry.retryable_errors,
        vec![TransportErrorKind::Timeout, TransportErrorKind::Dns]
    );
    assert_eq!(config.retry.max_retries, 3);
    assert_eq!(
        config.data_completion.schema_for("fund").unwrap().standard,
        vec!["date".to_string()]
    );
    assert!(config.validated().is_ok());
}

#[test]
fn test_unknown_eviction_policy_rejected() {
    let result: Result<CacheConfig, _> =
        serde_json::from_value(json!({"cache_strategy": "random"}));
    assert!(result.is_err());
}

// ===== Validation =====

#[rstest]
#[case::zero_rate(|c: &mut PipelineConfig| c.rate_limit.requests_per_minute = 0.0)]
#[case::floor_above_rate(|c: &mut PipelineConfig| c.rate_limit.floor_requests_per_minute = 500.0)]
#[case::ceiling_below_rate(|c: &mut PipelineConfig| c.rate_limit.ceiling_requests_per_minute = Some(60.0))]
#[case::too_many_retries(|c: &mut PipelineConfig| c.retry.max_retries = 21)]
#[case::jitter_above_one(|c: &mut PipelineConfig| c.retry.jitter_factor = 1.5)]
#[case::bad_status_code(|c: &mut PipelineConfig| c.retry.retryable_status_codes.push(42))]
#[case::zero_failure_threshold(|c: &mut PipelineConfig| c.circuit_breaker.failure_threshold = 0)]
#[case::zero_concurrency(|c: &mut PipelineConfig| c.queue.max_concurrent = 0)]
#[case::zero_priority_levels(|c: &mut PipelineConfig| c.queue.priority_levels = 0)]
#[case::empty_cache(|c: &mut PipelineConfig| c.cache.max_cache_size = 0)]
#[case::score_above_100(|c: &mut PipelineConfig| c.data_completion.min_completeness_score = 101)]
fn test_out_of_bounds_rejected(#[case] mutate: fn(&mut PipelineConfig)) {
    let mut config = PipelineConfig::default();
    mutate(&mut config);

    assert!(config.validate().is_err());
    let err = config.validated().unwrap_err();
    assert!(err.to_string().starts_with("Invalid configuration"));
}

#[test]
fn test_config_error_converts_to_pipeline_error() {
    let mut config = PipelineConfig::default();
    config.queue.max_concurrent = 0;
    let err: PipelineError = config.validated().unwrap_err().into();
    assert_eq!(err.kind(), "config");
    assert!(!err.is_transient());
}

// ===== Property Tests =====

proptest! {
    #[test]
    fn test_valid_rate_bounds_accepted(
        rpm in 1.0f64..10_000.0,
        floor_share in 0.01f64..1.0,
        ceiling_mul in 1.0f64..4.0,
        burst in 1u32..1_000,
    ) {
        let config = RateLimitConfig {
            requests_per_minute: rpm,
            burst_limit: burst,
            floor_requests_per_minute: rpm * floor_share,
            ceiling_requests_per_minute: Some(rpm * ceiling_mul),
            ..Default::default()
        };
        prop_assert!(config.validate().is_ok());
        prop_assert!(config.ceiling() >= config.requests_per_minute);
    }

    #[test]
    fn test_base_delay_must_not_exceed_max(base in 1u64..100_000, max in 1u64..100_000) {
        let config = RetryConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            ..Default::default()
        };
        prop_assert_eq!(config.validate().is_ok(), base <= max);
    }

    #[test]
    fn test_quality_report_score_always_clamped(score in any::<u8>()) {
        let report = QualityReport::new(score, vec![], SourceReliability::Low, vec![], vec![]);
        prop_assert!(report.completeness_score() <= 100);
    }
}
