//! The upstream data-access capability and the runtime clock.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Instant;
use upstream_guard_core::{Clock, FetchError, PipelineRequest};

/// Performs one upstream call for a request. The pipeline owns retries,
/// timeouts and caching; implementations should make exactly one attempt.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &PipelineRequest) -> Result<Value, FetchError>;
}

/// Adapts an async closure into a [`Fetcher`].
pub struct FnFetcher<F>(pub F);

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(PipelineRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FetchError>> + Send,
{
    async fn fetch(&self, request: &PipelineRequest) -> Result<Value, FetchError> {
        (self.0)(request.clone()).await
    }
}

/// Clock that follows tokio's time source, so paused-time tests drive the
/// limiter, breaker and cache together with sleeps and timeouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}
