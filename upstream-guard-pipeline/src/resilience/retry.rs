//! Retry with exponential backoff and jitter around single upstream attempts.
//!
//! Failures are classified by [`RetryPolicy::classify`]: configured status
//! codes and transport error kinds are retryable, everything else is fatal
//! and returned without consuming the remaining budget. The delay after the
//! n-th failed attempt (1-indexed) is
//!
//! ```text
//! min(base_delay * multiplier^(n-1) * (1 + random(0, jitter_factor)), max_delay)
//! ```

use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use upstream_guard_core::{
    FetchError, PipelineError, RetryConfig, TimeoutStage, TransportErrorKind,
};

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Backoff and classification rules derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay_ms: f64,
    max_delay_ms: f64,
    jitter_factor: f64,
    multiplier: f64,
    retryable_status_codes: HashSet<u16>,
    retryable_errors: HashSet<TransportErrorKind>,
    attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, multiplier: f64) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms as f64,
            max_delay_ms: config.max_delay_ms as f64,
            jitter_factor: config.jitter_factor,
            multiplier,
            retryable_status_codes: config.retryable_status_codes.iter().copied().collect(),
            retryable_errors: config.retryable_errors.iter().copied().collect(),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    pub fn classify(&self, error: &FetchError) -> Classification {
        let retryable = match error {
            FetchError::Status { code, .. } => self.retryable_status_codes.contains(code),
            FetchError::Transport { kind, .. } => self.retryable_errors.contains(kind),
            FetchError::Other(_) => false,
        };
        if retryable {
            Classification::Retryable
        } else {
            Classification::Fatal
        }
    }

    /// Delay after the n-th failure before jitter, in milliseconds.
    pub fn base_delay_for(&self, failed_attempt: u32) -> f64 {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        (self.base_delay_ms * self.multiplier.powi(exponent)).min(self.max_delay_ms)
    }

    /// Delay after the n-th failure for a given jitter sample in `[0, 1]`.
    pub fn delay_with_jitter(&self, failed_attempt: u32, sample: f64) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let jitter = 1.0 + sample.clamp(0.0, 1.0) * self.jitter_factor;
        let ms = (self.base_delay_ms * self.multiplier.powi(exponent) * jitter)
            .min(self.max_delay_ms);
        Duration::from_millis(ms.round() as u64)
    }

    /// Delay after the n-th failure with a random jitter sample.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(failed_attempt, sample)
    }
}

/// Per-attempt context, scoped to one logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttemptContext {
    /// 1-indexed.
    pub attempt_number: u32,
    pub last_error: Option<FetchError>,
}

/// Why a single attempt did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// The upstream was called and failed.
    Upstream(FetchError),
    /// The attempt was refused before reaching the upstream. Ends the call.
    Rejected(PipelineError),
}

impl From<FetchError> for AttemptError {
    fn from(err: FetchError) -> Self {
        AttemptError::Upstream(err)
    }
}

/// Runs attempts under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `attempt` until it succeeds, fails fatally, or the retry budget is
    /// spent. `observe` sees every attempt that reached the upstream, with
    /// `None` for success.
    pub async fn execute<T, F, Fut, O>(&self, mut attempt: F, mut observe: O) -> Result<T, PipelineError>
    where
        F: FnMut(RetryAttemptContext) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
        O: FnMut(u32, Option<&FetchError>),
    {
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut context = RetryAttemptContext {
            attempt_number: 1,
            last_error: None,
        };

        loop {
            let attempt_number = context.attempt_number;
            debug!("Retry attempt {}/{}", attempt_number, max_attempts);
            metrics::counter!("upstream_guard_upstream_attempts_total").increment(1);

            let (error, timed_out) =
                match timeout(self.policy.attempt_timeout, attempt(context.clone())).await {
                    Ok(Ok(value)) => {
                        observe(attempt_number, None);
                        if attempt_number > 1 {
                            debug!("Operation succeeded after {} retries", attempt_number - 1);
                        }
                        return Ok(value);
                    }
                    Ok(Err(AttemptError::Rejected(err))) => return Err(err),
                    Ok(Err(AttemptError::Upstream(err))) => (err, false),
                    Err(_) => (
                        FetchError::transport(
                            TransportErrorKind::Timeout,
                            format!(
                                "attempt exceeded {}ms",
                                self.policy.attempt_timeout.as_millis()
                            ),
                        ),
                        true,
                    ),
                };

            observe(attempt_number, Some(&error));

            let exhausted = attempt_number >= max_attempts;
            if self.policy.classify(&error) == Classification::Fatal || exhausted {
                if exhausted {
                    warn!("Max retry attempts reached after {} attempts: {}", attempt_number, error);
                } else {
                    warn!("Error is not retryable, giving up: {}", error);
                }
                return Err(if timed_out {
                    PipelineError::Timeout {
                        stage: TimeoutStage::Attempt,
                        elapsed_ms: self.policy.attempt_timeout.as_millis() as u64,
                    }
                } else {
                    PipelineError::Upstream {
                        source: error,
                        attempts: attempt_number,
                    }
                });
            }

            let delay = self.policy.delay_for(attempt_number);
            debug!("Retrying after {:?}: {}", delay, error);
            sleep(delay).await;

            context = RetryAttemptContext {
                attempt_number: attempt_number + 1,
                last_error: Some(error),
            };
        }
    }
}
