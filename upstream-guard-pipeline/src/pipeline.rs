//! Request pipeline composing the limiter, breaker, retry executor, cache
//! and quality reporter around an upstream [`Fetcher`].
//!
//! Order of operations for one request:
//!
//! 1. input validation and priority bounds
//! 2. cache lookup (skipped on force-refresh)
//! 3. join an in-flight fetch for the same key, or lead a new one:
//!    admission (concurrency permit + rate-limit token), breaker check, then
//!    a spawned dispatch running the retry executor
//! 4. on success the payload is written to the cache; on failure the stale
//!    fallback policy applies
//! 5. the payload is scored and the report attached to the response
//!
//! The dispatch task is detached from the callers once the upstream call
//! starts, so a cancelled caller still lets the result populate the cache.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use upstream_guard_core::{
    AcceptAll, Clock, ConfigError, FetchError, InputValidator, PipelineConfig, PipelineError,
    PipelineRequest, PipelineResponse, PipelineStats, ResponseMeta, Result,
};

use crate::fetcher::{Fetcher, FnFetcher, TokioClock};
use crate::performance::CacheLayer;
use crate::quality::DataQualityReporter;
use crate::rate_limit::AdaptiveThrottle;
use crate::reliability::{AdmissionPermit, AdmissionQueue};
use crate::resilience::{
    AttemptError, BreakerTicket, CircuitBreaker, CircuitBreakerError, RetryExecutor, RetryPolicy,
};

/// Payload produced by one upstream dispatch.
#[derive(Debug, Clone)]
struct Fetched {
    value: Arc<Value>,
}

type SharedFetch = Shared<BoxFuture<'static, Result<Fetched>>>;

struct InFlight {
    id: u64,
    fetch: WeakShared<BoxFuture<'static, Result<Fetched>>>,
}

/// Where a response payload came from.
#[derive(Debug, Clone, Copy)]
struct Origin {
    from_cache: bool,
    stale: bool,
    data_age_ms: u64,
}

impl Origin {
    fn fresh() -> Self {
        Self {
            from_cache: false,
            stale: false,
            data_age_ms: 0,
        }
    }
}

/// Per-key shared state owned by one pipeline instance.
pub struct PipelineState {
    throttle: AdaptiveThrottle,
    breaker: CircuitBreaker,
    cache: CacheLayer<Arc<Value>>,
    admission: AdmissionQueue,
    in_flight: DashMap<String, InFlight>,
    next_fetch_id: AtomicU64,
}

impl PipelineState {
    fn new(config: &PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            throttle: AdaptiveThrottle::new(config.rate_limit.clone(), clock.clone()),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone(), clock.clone()),
            cache: CacheLayer::new(
                &config.cache,
                config.data_completion.enable_fallback,
                clock,
            ),
            admission: AdmissionQueue::new(config.queue.clone()),
            in_flight: DashMap::new(),
            next_fetch_id: AtomicU64::new(0),
        }
    }

    pub fn throttle(&self) -> &AdaptiveThrottle {
        &self.throttle
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &CacheLayer<Arc<Value>> {
        &self.cache
    }

    pub fn admission(&self) -> &AdmissionQueue {
        &self.admission
    }

    /// Keys with an upstream fetch currently in flight.
    pub fn in_flight_keys(&self) -> usize {
        self.in_flight.len()
    }
}

struct PipelineInner {
    config: PipelineConfig,
    state: PipelineState,
    retry: RetryExecutor,
    reporter: DataQualityReporter,
    validator: Arc<dyn InputValidator>,
}

/// Builder for [`RequestPipeline`].
pub struct RequestPipelineBuilder {
    config: PipelineConfig,
    clock: Option<Arc<dyn Clock>>,
    validator: Option<Arc<dyn InputValidator>>,
}

impl RequestPipelineBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Validate the configuration and construct the pipeline.
    pub fn build(self) -> std::result::Result<RequestPipeline, ConfigError> {
        let config = self.config.validated()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let retry = RetryExecutor::new(RetryPolicy::from_config(
            &config.retry,
            config.rate_limit.backoff_multiplier,
        ));

        Ok(RequestPipeline {
            inner: Arc::new(PipelineInner {
                state: PipelineState::new(&config, clock),
                retry,
                reporter: DataQualityReporter::new(),
                validator: self.validator.unwrap_or_else(|| Arc::new(AcceptAll)),
                config,
            }),
        })
    }
}

/// Resilient, quality-annotated access to an upstream. Cheap to clone.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<PipelineInner>,
}

impl RequestPipeline {
    pub fn builder(config: PipelineConfig) -> RequestPipelineBuilder {
        RequestPipelineBuilder {
            config,
            clock: None,
            validator: None,
        }
    }

    pub fn new(config: PipelineConfig) -> std::result::Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &PipelineState {
        &self.inner.state
    }

    /// Run `request` through the pipeline with an async closure as the fetcher.
    pub async fn invoke<F, Fut>(
        &self,
        request: PipelineRequest,
        fetch: F,
    ) -> Result<PipelineResponse<Value>>
    where
        F: Fn(PipelineRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Value, FetchError>> + Send + 'static,
    {
        self.invoke_with(request, Arc::new(FnFetcher(fetch))).await
    }

    pub async fn invoke_with(
        &self,
        request: PipelineRequest,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<PipelineResponse<Value>> {
        let span = info_span!(
            "invoke",
            key = %request.resource_key,
            category = %request.category,
            priority = request.priority,
        );
        let result = self.inner.run(request, fetcher).instrument(span).await;

        let outcome = match &result {
            Ok(response) if response.meta.stale => "stale",
            Ok(response) if response.meta.from_cache => "cache_hit",
            Ok(_) => "fresh",
            Err(err) => err.kind(),
        };
        metrics::counter!("upstream_guard_requests_total", "outcome" => outcome).increment(1);
        result
    }

    pub fn stats(&self, resource_key: &str) -> PipelineStats {
        let state = &self.inner.state;
        PipelineStats {
            resource_key: resource_key.to_string(),
            circuit_breaker: state.breaker.snapshot(resource_key),
            cache: state.cache.statistics(),
            rate_limiter: state.throttle.snapshot(resource_key),
            queue: state.admission.snapshot(),
        }
    }

    /// Drop the cached entry for `resource_key`.
    pub fn invalidate(&self, resource_key: &str) -> bool {
        self.inner.state.cache.invalidate(resource_key)
    }

    /// Drop every cached entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.inner
            .state
            .cache
            .invalidate_matching(|key| key.starts_with(prefix))
    }

    pub fn reset_breaker(&self, resource_key: &str) {
        self.inner.state.breaker.reset(resource_key);
    }

    pub fn clear_cache(&self) {
        self.inner.state.cache.clear();
    }
}

impl PipelineInner {
    async fn run(
        self: &Arc<Self>,
        request: PipelineRequest,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<PipelineResponse<Value>> {
        self.validator
            .validate(&request)
            .map_err(PipelineError::InvalidRequest)?;

        let levels = self.config.queue.priority_levels;
        if request.priority >= levels {
            return Err(PipelineError::InvalidRequest(format!(
                "priority {} outside 0..{}",
                request.priority, levels
            )));
        }

        if !request.force_refresh {
            if let Some(hit) = self.state.cache.get(&request.resource_key) {
                debug!("Cache hit for {}", request.resource_key);
                let origin = Origin {
                    from_cache: true,
                    stale: false,
                    data_age_ms: hit.age_ms,
                };
                return self.respond(&request, &hit.value, origin, Vec::new());
            }
        }

        match self.fetch_coalesced(&request, fetcher).await {
            Ok(fetched) => self.respond(&request, &fetched.value, Origin::fresh(), Vec::new()),
            Err(err) => self.fallback(&request, err),
        }
    }

    /// Join the in-flight fetch for this key, or start one.
    async fn fetch_coalesced(
        self: &Arc<Self>,
        request: &PipelineRequest,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Fetched> {
        let fetch = match self.state.in_flight.entry(request.resource_key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get().fetch.upgrade() {
                Some(existing) => {
                    debug!("Joining in-flight fetch for {}", request.resource_key);
                    existing
                }
                None => {
                    let (fetch, in_flight) = self.start_fetch(request, fetcher);
                    if let Some(in_flight) = in_flight {
                        occupied.insert(in_flight);
                    }
                    fetch
                }
            },
            Entry::Vacant(vacant) => {
                let (fetch, in_flight) = self.start_fetch(request, fetcher);
                if let Some(in_flight) = in_flight {
                    vacant.insert(in_flight);
                }
                fetch
            }
        };

        fetch.await
    }

    fn start_fetch(
        self: &Arc<Self>,
        request: &PipelineRequest,
        fetcher: Arc<dyn Fetcher>,
    ) -> (SharedFetch, Option<InFlight>) {
        let id = self.state.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let fetch = self
            .clone()
            .lead(request.clone(), fetcher, id)
            .boxed()
            .shared();
        let in_flight = fetch.downgrade().map(|weak| InFlight { id, fetch: weak });
        (fetch, in_flight)
    }

    /// Admission, breaker check and dispatch for the first caller on a key.
    async fn lead(
        self: Arc<Self>,
        request: PipelineRequest,
        fetcher: Arc<dyn Fetcher>,
        id: u64,
    ) -> Result<Fetched> {
        let key = request.resource_key.clone();
        let result = self.clone().admit_and_dispatch(request, fetcher).await;
        self.state.in_flight.remove_if(&key, |_, in_flight| in_flight.id == id);
        result
    }

    async fn admit_and_dispatch(
        self: Arc<Self>,
        request: PipelineRequest,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Fetched> {
        let key = request.resource_key.clone();
        let permit = self
            .state
            .admission
            .admit(&key, request.priority, || self.state.throttle.try_acquire(&key))
            .await?;

        let ticket = self
            .state
            .breaker
            .try_acquire(&key)
            .map_err(|err| circuit_open(&key, err))?;

        let handle = tokio::spawn(self.clone().dispatch(request, fetcher, permit, ticket));
        match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(PipelineError::Upstream {
                source: FetchError::Other(format!("dispatch task failed: {}", join_error)),
                attempts: 0,
            }),
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        request: PipelineRequest,
        fetcher: Arc<dyn Fetcher>,
        permit: AdmissionPermit,
        ticket: BreakerTicket,
    ) -> Result<Fetched> {
        let _permit = permit;
        let key = request.resource_key.as_str();
        let started = Instant::now();
        // Breaker ticket of the attempt currently running.
        let current = Mutex::new(ticket);
        let current = &current;

        let result = self
            .retry
            .execute(
                |ctx| {
                    let inner = self.clone();
                    let fetcher = fetcher.clone();
                    let request = request.clone();
                    async move {
                        let key = request.resource_key.as_str();
                        if ctx.attempt_number > 1 {
                            let ticket = inner
                                .state
                                .breaker
                                .try_acquire(key)
                                .map_err(|err| AttemptError::Rejected(circuit_open(key, err)))?;
                            *lock_ticket(current) = ticket;
                        }
                        fetcher.fetch(&request).await.map_err(AttemptError::Upstream)
                    }
                },
                |_, outcome| self.record_outcome(key, *lock_ticket(current), outcome),
            )
            .await;

        metrics::histogram!("upstream_guard_fetch_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let value = Arc::new(result?);
        let ttl = self.config.cache.ttl_for(&request.category);
        let size_hint = value.to_string().len();
        self.state
            .cache
            .set_with_size_hint(key, value.clone(), ttl, size_hint);
        debug!("Cached {} for {:?}", key, ttl);

        Ok(Fetched { value })
    }

    /// Feed one attempt outcome into the breaker and throttle.
    fn record_outcome(&self, key: &str, ticket: BreakerTicket, outcome: Option<&FetchError>) {
        let state = &self.state;
        let update = match outcome {
            None => {
                state.breaker.record_success(key, ticket);
                state.throttle.record_success(key)
            }
            Some(err) => {
                state.breaker.record_failure(key, ticket);
                if err.is_throttled() {
                    let update = state.throttle.record_throttled(key);
                    if update.sustained_throttling {
                        state.breaker.trip(key);
                    }
                    update
                } else {
                    state.throttle.record_failure(key)
                }
            }
        };

        if update.changed() {
            metrics::gauge!("upstream_guard_rate_limit_current", "key" => key.to_string())
                .set(update.current_limit);
        }
    }

    /// Serve a stale cache entry in place of `err` when policy allows.
    fn fallback(
        &self,
        request: &PipelineRequest,
        err: PipelineError,
    ) -> Result<PipelineResponse<Value>> {
        let policy = &self.config.data_completion;
        let eligible = policy.enable_fallback
            && request.priority <= policy.fallback_priority
            && err.is_transient();
        if !eligible {
            return Err(err);
        }

        match self.state.cache.get_stale(&request.resource_key) {
            Some(entry) => {
                warn!(
                    "Serving stale data for {} ({}ms old): {}",
                    request.resource_key, entry.age_ms, err
                );
                metrics::counter!("upstream_guard_stale_served_total").increment(1);
                let origin = Origin {
                    from_cache: true,
                    stale: true,
                    data_age_ms: entry.age_ms,
                };
                let warning = format!("served stale cached data after failure: {}", err);
                self.respond(request, &entry.value, origin, vec![warning])
            }
            None => Err(err),
        }
    }

    /// Score the payload and assemble the response.
    fn respond(
        &self,
        request: &PipelineRequest,
        value: &Arc<Value>,
        origin: Origin,
        mut warnings: Vec<String>,
    ) -> Result<PipelineResponse<Value>> {
        let policy = &self.config.data_completion;
        let hints = policy
            .schema_for(&request.category)
            .cloned()
            .unwrap_or_default();

        let mut data = Value::clone(value);
        if policy.fill_missing_fields {
            let filled = self.reporter.fill_missing(&mut data, &hints);
            if !filled.is_empty() {
                warnings.push(format!("filled missing fields with null: {}", filled.join(", ")));
            }
        }

        let report = self.reporter.evaluate(&data, &hints);
        if policy.validate_completeness && report.completeness_score() < policy.min_completeness_score
        {
            return Err(PipelineError::DataQuality {
                key: request.resource_key.clone(),
                score: report.completeness_score(),
                floor: policy.min_completeness_score,
            });
        }
        warnings.extend(report.warnings().iter().cloned());

        Ok(PipelineResponse {
            data,
            meta: ResponseMeta {
                from_cache: origin.from_cache,
                stale: origin.stale,
                data_age_ms: origin.data_age_ms,
                completeness_score: report.completeness_score(),
                source_reliability: report.source_reliability(),
                warnings,
                quality: report,
            },
        })
    }
}

fn lock_ticket(ticket: &Mutex<BreakerTicket>) -> MutexGuard<'_, BreakerTicket> {
    match ticket.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn circuit_open(key: &str, err: CircuitBreakerError) -> PipelineError {
    PipelineError::CircuitOpen {
        key: key.to_string(),
        retry_after_ms: err.retry_after_ms(),
    }
}
