use config::Environment;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::HashMap;
use std::fs;
use upstream_guard::{simulate, AppConfig, LogFormat, SimulationOptions};
use upstream_guard_core::{EvictionPolicy, PipelineConfig};
use upstream_guard_pipeline::RequestPipeline;

fn no_env() -> Environment {
    Environment::with_prefix("UPSTREAM_GUARD")
        .prefix_separator("__")
        .separator("__")
        .source(Some(HashMap::new()))
}

fn env(vars: &[(&str, &str)]) -> Environment {
    let source = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    Environment::with_prefix("UPSTREAM_GUARD")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .source(Some(source))
}

// ===== Configuration Loading =====

#[test]
fn test_shipped_default_file_matches_code_defaults() {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../config");
    let config = AppConfig::load_with_env(&dir, no_env()).unwrap();
    assert_eq!(config, AppConfig::default());
}

#[test]
fn test_local_file_overrides_default() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("default.toml"),
        "[pipeline.queue]\nmax_concurrent = 2\n[pipeline.cache]\ncache_strategy = \"lfu\"\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("local.toml"),
        "[log]\nformat = \"json\"\n[pipeline.queue]\nmax_concurrent = 9\n",
    )
    .unwrap();

    let config = AppConfig::load_with_env(dir.path(), no_env()).unwrap();
    assert_eq!(config.pipeline.queue.max_concurrent, 9);
    assert_eq!(config.pipeline.cache.cache_strategy, EvictionPolicy::Lfu);
    assert_eq!(config.log.format, LogFormat::Json);
    assert_eq!(config.pipeline.queue.max_queue_size, 100);
}

#[test]
fn test_environment_overrides_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("default.toml"),
        "[pipeline.retry]\nmax_retries = 1\n",
    )
    .unwrap();

    let config = AppConfig::load_with_env(
        dir.path(),
        env(&[
            ("UPSTREAM_GUARD__PIPELINE__RETRY__MAX_RETRIES", "5"),
            ("UPSTREAM_GUARD__PIPELINE__DATA_COMPLETION__ENABLE_FALLBACK", "false"),
        ]),
    )
    .unwrap();
    assert_eq!(config.pipeline.retry.max_retries, 5);
    assert!(!config.pipeline.data_completion.enable_fallback);
}

#[rstest]
#[case::zero_concurrency("[pipeline.queue]\nmax_concurrent = 0\n")]
#[case::inverted_delays("[pipeline.retry]\nbase_delay_ms = 5000\nmax_delay_ms = 100\n")]
#[case::unknown_policy("[pipeline.cache]\ncache_strategy = \"mru\"\n")]
fn test_invalid_file_rejected(#[case] contents: &str) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("default.toml"), contents).unwrap();
    assert!(AppConfig::load_with_env(dir.path(), no_env()).is_err());
}

// ===== Simulation =====

fn quiet_options() -> SimulationOptions {
    SimulationOptions {
        requests: 20,
        keys: 4,
        concurrency: 1,
        failure_rate: 0.0,
        throttle_rate: 0.0,
        incomplete_rate: 0.0,
        latency_ms: 0,
        refresh_every: 0,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_healthy_upstream_is_cached_per_key() {
    let pipeline = RequestPipeline::new(PipelineConfig::default()).unwrap();
    let report = simulate::run(&pipeline, &quiet_options()).await.unwrap();

    assert_eq!(report.upstream_calls, 4);
    assert_eq!(report.outcomes.get("fresh"), Some(&4));
    assert_eq!(report.outcomes.get("cache_hit"), Some(&16));
    assert_eq!(report.average_completeness, 100.0);
    assert_eq!(report.keys.len(), 4);
    assert_eq!(report.keys[0].resource_key, "daily:SYM000");
}

#[tokio::test(start_paused = true)]
async fn test_throttling_upstream_surfaces_errors() {
    let mut config = PipelineConfig::default();
    config.retry.max_retries = 0;
    let pipeline = RequestPipeline::new(config).unwrap();

    let options = SimulationOptions {
        requests: 3,
        keys: 1,
        throttle_rate: 1.0,
        ..quiet_options()
    };
    let report = simulate::run(&pipeline, &options).await.unwrap();

    assert_eq!(report.upstream_calls, 3);
    assert_eq!(report.outcomes.get("upstream"), Some(&3));
    assert!(report.keys[0].rate_limiter.current_limit < 120.0);
}

#[tokio::test]
async fn test_bad_rates_rejected_before_running() {
    let pipeline = RequestPipeline::new(PipelineConfig::default()).unwrap();
    let options = SimulationOptions {
        incomplete_rate: 2.0,
        ..quiet_options()
    };
    assert!(simulate::run(&pipeline, &options).await.is_err());
}
