//! Per-endpoint circuit breaker.
//!
//! # States
//!
//! - **Closed**: requests pass through; failures inside the monitoring window
//!   are counted
//! - **Open**: requests are rejected without reaching the upstream
//! - **HalfOpen**: a bounded number of probe requests test recovery
//!
//! Transitions are evaluated lazily against the injected [`Clock`]: an Open
//! breaker becomes HalfOpen on the first admission check after `timeout_ms`
//! has elapsed. Each key's state is mutated under its map entry lock, so
//! failures on one key never touch another key's breaker.
//!
//! Every admission hands out a [`BreakerTicket`]. While HalfOpen only
//! outcomes reported with a probe ticket from the current half-open round
//! move the breaker; a call admitted while Closed that finishes late is
//! counted in the metrics and otherwise ignored.

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use upstream_guard_core::{
    millis_between, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState, Clock,
};

/// Circuit breaker errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, request rejected
    #[error("Circuit breaker is open for {key}")]
    Open { key: String, retry_after_ms: u64 },

    /// Half-open probe budget exhausted
    #[error("Circuit breaker rejected request for {key}")]
    Rejected { key: String },
}

impl CircuitBreakerError {
    /// Milliseconds until the breaker may admit again, when known.
    pub fn retry_after_ms(&self) -> u64 {
        match self {
            CircuitBreakerError::Open { retry_after_ms, .. } => *retry_after_ms,
            CircuitBreakerError::Rejected { .. } => 0,
        }
    }
}

/// Proof of admission returned by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerTicket {
    probe_round: Option<u64>,
}

impl BreakerTicket {
    /// Whether this call was admitted as a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe_round.is_some()
    }
}

/// Process-wide counters across every key.
#[derive(Debug, Default)]
struct CircuitBreakerMetrics {
    failures: AtomicU64,
    successes: AtomicU64,
    opened_count: AtomicU64,
    closed_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_opened(&self) {
        self.opened_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("upstream_guard_circuit_open_total").increment(1);
    }

    fn record_closed(&self) {
        self.closed_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Breaker state for one resource key.
#[derive(Debug, Clone)]
pub struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    window_started_at: Instant,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_round: u64,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window_started_at: now,
            opened_at: None,
            half_open_in_flight: 0,
            half_open_round: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_in_flight = 0;
    }

    fn close(&mut self, now: Instant) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_in_flight = 0;
        self.window_started_at = now;
    }

    /// Open -> HalfOpen once the reset timeout has elapsed.
    fn poll_reset(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.state != CircuitState::Open {
            return false;
        }
        match self.opened_at {
            Some(opened_at) if now.saturating_duration_since(opened_at) >= timeout => {
                self.state = CircuitState::HalfOpen;
                self.success_count = 0;
                self.failure_count = 0;
                self.half_open_in_flight = 0;
                self.half_open_round += 1;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }
}

/// Circuit breaker keeping one state machine per resource key.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    states: DashMap<String, BreakerState>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            "Creating circuit breaker: failure_threshold={}, timeout={}ms",
            config.failure_threshold, config.timeout_ms
        );
        Self {
            config,
            clock,
            states: DashMap::new(),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn state_mut(&self, key: &str, now: Instant) -> RefMut<'_, String, BreakerState> {
        self.states
            .entry(key.to_string())
            .or_insert_with(|| BreakerState::new(now))
    }

    /// Check whether a call for `key` may proceed. The returned ticket must
    /// be passed to exactly one `record_success` or `record_failure`.
    pub fn try_acquire(&self, key: &str) -> Result<BreakerTicket, CircuitBreakerError> {
        let now = self.clock.now();
        let mut state = self.state_mut(key, now);

        if state.poll_reset(now, self.timeout()) {
            info!("Circuit breaker {} transitioning to half-open", key);
        }

        match state.state {
            CircuitState::Closed => Ok(BreakerTicket { probe_round: None }),
            CircuitState::Open => {
                self.metrics.record_rejected();
                let elapsed = state
                    .opened_at
                    .map(|opened_at| millis_between(opened_at, now))
                    .unwrap_or(0);
                let retry_after_ms = self.config.timeout_ms.saturating_sub(elapsed).max(1);
                debug!("Circuit breaker {} open, retry after {}ms", key, retry_after_ms);
                Err(CircuitBreakerError::Open {
                    key: key.to_string(),
                    retry_after_ms,
                })
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.config.half_open_max_requests {
                    self.metrics.record_rejected();
                    Err(CircuitBreakerError::Rejected {
                        key: key.to_string(),
                    })
                } else {
                    state.half_open_in_flight += 1;
                    Ok(BreakerTicket {
                        probe_round: Some(state.half_open_round),
                    })
                }
            }
        }
    }

    pub fn record_success(&self, key: &str, ticket: BreakerTicket) {
        let now = self.clock.now();
        let mut state = self.state_mut(key, now);
        self.metrics.record_success();

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen if ticket.probe_round != Some(state.half_open_round) => {
                debug!("Circuit breaker {} ignoring success from a non-probe call", key);
            }
            CircuitState::HalfOpen => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    info!(
                        "Circuit breaker {} closing after {} successes",
                        key, state.success_count
                    );
                    state.close(now);
                    self.metrics.record_closed();
                }
            }
            CircuitState::Open => {
                // A call admitted before the trip finished late; nothing to count.
            }
        }
    }

    pub fn record_failure(&self, key: &str, ticket: BreakerTicket) {
        let now = self.clock.now();
        let mut state = self.state_mut(key, now);
        self.metrics.record_failure();

        match state.state {
            CircuitState::Closed => {
                let window = Duration::from_millis(self.config.monitoring_window_ms);
                if now.saturating_duration_since(state.window_started_at) > window {
                    state.failure_count = 0;
                    state.window_started_at = now;
                }
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker {} opening after {} failures",
                        key, state.failure_count
                    );
                    state.open(now);
                    self.metrics.record_opened();
                }
            }
            CircuitState::HalfOpen if ticket.probe_round != Some(state.half_open_round) => {
                debug!("Circuit breaker {} ignoring failure from a non-probe call", key);
            }
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker {} re-opening due to failure in half-open state",
                    key
                );
                state.open(now);
                self.metrics.record_opened();
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker for `key` open, e.g. on sustained upstream throttling.
    pub fn trip(&self, key: &str) {
        let now = self.clock.now();
        let mut state = self.state_mut(key, now);
        if state.state != CircuitState::Open {
            warn!("Circuit breaker {} forced open", key);
            state.open(now);
            self.metrics.record_opened();
        }
    }

    /// Reset the breaker for `key` to Closed.
    pub fn reset(&self, key: &str) {
        let now = self.clock.now();
        if let Some(mut state) = self.states.get_mut(key) {
            info!("Manually resetting circuit breaker: {}", key);
            state.close(now);
        }
    }

    /// Current state of `key`, applying any pending Open -> HalfOpen move.
    pub fn state(&self, key: &str) -> CircuitState {
        let now = self.clock.now();
        match self.states.get_mut(key) {
            Some(mut state) => {
                state.poll_reset(now, self.timeout());
                state.state
            }
            None => CircuitState::Closed,
        }
    }

    pub fn snapshot(&self, key: &str) -> CircuitBreakerSnapshot {
        let state = self.state(key);
        let (failure_count, success_count) = self
            .states
            .get(key)
            .map(|s| (s.failure_count, s.success_count))
            .unwrap_or((0, 0));
        CircuitBreakerSnapshot {
            state,
            failure_count,
            success_count,
        }
    }

    /// Process-wide counters.
    pub fn metrics(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            failures: self.metrics.failures.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            opened_count: self.metrics.opened_count.load(Ordering::Relaxed),
            closed_count: self.metrics.closed_count.load(Ordering::Relaxed),
            rejected_count: self.metrics.rejected_count.load(Ordering::Relaxed),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub failures: u64,
    pub successes: u64,
    pub opened_count: u64,
    pub closed_count: u64,
    pub rejected_count: u64,
}
