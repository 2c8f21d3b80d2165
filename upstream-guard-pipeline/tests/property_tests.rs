use proptest::prelude::*;
use serde_json::{Map, Value};
use std::sync::Arc;
use upstream_guard_core::{ManualClock, RetryConfig, SchemaHints};
use upstream_guard_pipeline::{DataQualityReporter, RetryPolicy, TokenBucketLimiter};

// ===== Token Bucket =====

proptest! {
    #[test]
    fn test_grants_never_exceed_burst_without_refill(
        burst in 1u32..50,
        rpm in 1.0f64..600.0,
        requests in 0usize..120,
    ) {
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucketLimiter::new(burst, rpm, clock);

        let granted = (0..requests)
            .filter(|_| limiter.try_acquire("k").granted)
            .count();
        prop_assert_eq!(granted, requests.min(burst as usize));
    }

    #[test]
    fn test_denial_reports_positive_wait(burst in 1u32..20, rpm in 1.0f64..600.0) {
        let clock = Arc::new(ManualClock::new());
        let limiter = TokenBucketLimiter::new(burst, rpm, clock.clone());
        for _ in 0..burst {
            prop_assert!(limiter.try_acquire("k").granted);
        }

        let denied = limiter.try_acquire("k");
        prop_assert!(!denied.granted);
        prop_assert!(denied.retry_after_ms > 0);

        clock.advance_ms(denied.retry_after_ms);
        prop_assert!(limiter.try_acquire("k").granted);
    }
}

// ===== Backoff =====

proptest! {
    #[test]
    fn test_backoff_stays_within_jitter_band(
        base in 1u64..5_000,
        extra in 0u64..60_000,
        jitter in 0.0f64..1.0,
        multiplier in 1.0f64..4.0,
        failed_attempt in 1u32..12,
        sample in 0.0f64..=1.0,
    ) {
        let config = RetryConfig {
            base_delay_ms: base,
            max_delay_ms: base + extra,
            jitter_factor: jitter,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config, multiplier);

        let floor = policy.base_delay_for(failed_attempt);
        let ceiling = (floor * (1.0 + jitter)).min(config.max_delay_ms as f64);
        let delay = policy.delay_with_jitter(failed_attempt, sample).as_millis() as f64;

        prop_assert!(delay + 0.5 >= floor);
        prop_assert!(delay <= ceiling + 0.5);
        prop_assert!(delay <= config.max_delay_ms as f64);
    }
}

// ===== Completeness =====

proptest! {
    #[test]
    fn test_completeness_score_in_range(present in proptest::collection::vec(any::<bool>(), 6)) {
        let names = ["close", "open", "high", "low", "volume", "amount"];
        let hints = SchemaHints::new()
            .critical(["close"])
            .important(["open", "high", "low"])
            .standard(["volume", "amount"]);

        let record: Map<String, Value> = names
            .iter()
            .zip(&present)
            .filter(|(_, keep)| **keep)
            .map(|(name, _)| (name.to_string(), Value::from(1.0)))
            .collect();

        let report = DataQualityReporter::new().evaluate(&Value::Object(record), &hints);
        prop_assert!(report.completeness_score() <= 100);
        prop_assert_eq!(report.completeness_score() == 100, present.iter().all(|p| *p));
        prop_assert_eq!(report.missing_fields().is_empty(), present.iter().all(|p| *p));
    }
}
