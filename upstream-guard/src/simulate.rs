//! Synthetic upstream and a load driver for exercising the pipeline.

use anyhow::{ensure, Result};
use async_trait::async_trait;
use clap::Args;
use futures::stream::{self, StreamExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use upstream_guard_core::{FetchError, PipelineRequest, PipelineStats, TransportErrorKind};
use upstream_guard_pipeline::{Fetcher, RequestPipeline};

#[derive(Debug, Clone, Args)]
pub struct SimulationOptions {
    /// Total logical requests to issue.
    #[arg(long, default_value_t = 200)]
    pub requests: usize,

    /// Distinct resource keys the requests rotate over.
    #[arg(long, default_value_t = 4)]
    pub keys: usize,

    /// Request category (selects TTL and quality schema).
    #[arg(long, default_value = "daily")]
    pub category: String,

    /// Requests in flight at once from the driver.
    #[arg(long, default_value_t = 16)]
    pub concurrency: usize,

    /// Share of upstream calls failing with a 503 or a reset connection.
    #[arg(long, default_value_t = 0.1)]
    pub failure_rate: f64,

    /// Share of upstream calls answered with 429.
    #[arg(long, default_value_t = 0.05)]
    pub throttle_rate: f64,

    /// Share of successful payloads missing their critical fields.
    #[arg(long, default_value_t = 0.1)]
    pub incomplete_rate: f64,

    /// Simulated upstream latency.
    #[arg(long, default_value_t = 20)]
    pub latency_ms: u64,

    /// Bypass the cache on every n-th request (0 disables).
    #[arg(long, default_value_t = 5)]
    pub refresh_every: usize,

    #[arg(long, default_value_t = 7)]
    pub seed: u64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            requests: 200,
            keys: 4,
            category: "daily".to_string(),
            concurrency: 16,
            failure_rate: 0.1,
            throttle_rate: 0.05,
            incomplete_rate: 0.1,
            latency_ms: 20,
            refresh_every: 5,
            seed: 7,
        }
    }
}

impl SimulationOptions {
    fn check(&self) -> Result<()> {
        ensure!(self.keys > 0, "--keys must be at least 1");
        ensure!(self.concurrency > 0, "--concurrency must be at least 1");
        for (name, rate) in [
            ("failure-rate", self.failure_rate),
            ("throttle-rate", self.throttle_rate),
            ("incomplete-rate", self.incomplete_rate),
        ] {
            ensure!((0.0..=1.0).contains(&rate), "--{} must be within 0..=1", name);
        }
        ensure!(
            self.failure_rate + self.throttle_rate <= 1.0,
            "--failure-rate plus --throttle-rate must not exceed 1"
        );
        Ok(())
    }
}

/// Upstream that fails, throttles and drops fields at configured rates.
pub struct SyntheticUpstream {
    rng: Mutex<StdRng>,
    failure_rate: f64,
    throttle_rate: f64,
    incomplete_rate: f64,
    latency: Duration,
    calls: AtomicU64,
}

enum Roll {
    Throttled,
    Unavailable,
    Reset,
    Payload { incomplete: bool, base: f64 },
}

impl SyntheticUpstream {
    pub fn new(options: &SimulationOptions) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(options.seed)),
            failure_rate: options.failure_rate,
            throttle_rate: options.throttle_rate,
            incomplete_rate: options.incomplete_rate,
            latency: Duration::from_millis(options.latency_ms),
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn roll(&self) -> Roll {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let r: f64 = rng.gen();
        if r < self.throttle_rate {
            Roll::Throttled
        } else if r < self.throttle_rate + self.failure_rate {
            if rng.gen_bool(0.5) {
                Roll::Unavailable
            } else {
                Roll::Reset
            }
        } else {
            Roll::Payload {
                incomplete: rng.gen::<f64>() < self.incomplete_rate,
                base: rng.gen_range(10.0..200.0),
            }
        }
    }
}

#[async_trait]
impl Fetcher for SyntheticUpstream {
    async fn fetch(&self, request: &PipelineRequest) -> Result<Value, FetchError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let roll = self.roll();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match roll {
            Roll::Throttled => Err(FetchError::status(429, "too many requests")),
            Roll::Unavailable => Err(FetchError::status(503, "service unavailable")),
            Roll::Reset => Err(FetchError::transport(
                TransportErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
            Roll::Payload { incomplete, base } => {
                Ok(synthetic_payload(&request.category, incomplete, base))
            }
        }
    }
}

fn synthetic_payload(category: &str, incomplete: bool, base: f64) -> Value {
    let mut record = match category {
        "quote" | "realtime" => json!({
            "price": base,
            "volume": 12_000,
            "open": base * 0.99,
            "high": base * 1.02,
            "low": base * 0.97,
        }),
        _ => json!({
            "open": base * 0.99,
            "high": base * 1.02,
            "low": base * 0.97,
            "close": base,
            "volume": 12_000,
            "amount": base * 12_000.0,
        }),
    };
    if incomplete {
        if let Value::Object(fields) = &mut record {
            fields.remove("close");
            fields.remove("price");
            fields.remove("amount");
        }
    }
    record
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub requests: usize,
    /// Request count per outcome (`fresh`, `cache_hit`, `stale`, or an error kind).
    pub outcomes: BTreeMap<String, u64>,
    pub upstream_calls: u64,
    pub average_completeness: f64,
    pub elapsed_ms: u64,
    pub keys: Vec<PipelineStats>,
}

fn resource_key(category: &str, index: usize) -> String {
    format!("{}:SYM{:03}", category, index)
}

/// Drive `options.requests` requests through `pipeline` against a synthetic upstream.
pub async fn run(pipeline: &RequestPipeline, options: &SimulationOptions) -> Result<SimulationReport> {
    options.check()?;

    let upstream = Arc::new(SyntheticUpstream::new(options));
    let started = tokio::time::Instant::now();
    info!(
        requests = options.requests,
        keys = options.keys,
        category = %options.category,
        "starting simulation"
    );

    let results: Vec<_> = stream::iter(0..options.requests)
        .map(|i| {
            let pipeline = pipeline.clone();
            let fetcher: Arc<dyn Fetcher> = upstream.clone();
            let mut request =
                PipelineRequest::new(resource_key(&options.category, i % options.keys), &options.category);
            if options.refresh_every > 0 && i > 0 && i % options.refresh_every == 0 {
                request = request.force_refresh();
            }
            async move { pipeline.invoke_with(request, fetcher).await }
        })
        .buffer_unordered(options.concurrency)
        .collect()
        .await;

    let mut outcomes = BTreeMap::new();
    let mut scores = Vec::new();
    for result in &results {
        let outcome = match result {
            Ok(response) => {
                scores.push(f64::from(response.meta.completeness_score));
                if response.meta.stale {
                    "stale"
                } else if response.meta.from_cache {
                    "cache_hit"
                } else {
                    "fresh"
                }
            }
            Err(err) => {
                debug!(error = %err, "simulated request failed");
                err.kind()
            }
        };
        *outcomes.entry(outcome.to_string()).or_insert(0) += 1;
    }

    let average_completeness = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };

    let keys = (0..options.keys)
        .map(|i| pipeline.stats(&resource_key(&options.category, i)))
        .collect();

    let report = SimulationReport {
        requests: options.requests,
        outcomes,
        upstream_calls: upstream.calls(),
        average_completeness,
        elapsed_ms: started.elapsed().as_millis() as u64,
        keys,
    };
    info!(
        upstream_calls = report.upstream_calls,
        elapsed_ms = report.elapsed_ms,
        "simulation finished"
    );
    Ok(report)
}
