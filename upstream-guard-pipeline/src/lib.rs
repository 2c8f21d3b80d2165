//! Resilience and data-quality middleware around upstream data calls.
//!
//! - [`rate_limit`]: per-endpoint token buckets with adaptive limits
//! - [`resilience`]: circuit breaker and retry executor
//! - [`performance`]: tiered-TTL response cache
//! - [`reliability`]: priority admission queue
//! - [`quality`]: completeness and integrity scoring
//! - [`pipeline`]: the composed request pipeline

pub mod fetcher;
pub mod performance;
pub mod pipeline;
pub mod quality;
pub mod rate_limit;
pub mod reliability;
pub mod resilience;

pub use fetcher::{Fetcher, FnFetcher, TokioClock};
pub use performance::{CacheLayer, CachedValue};
pub use pipeline::{PipelineState, RequestPipeline, RequestPipelineBuilder};
pub use quality::DataQualityReporter;
pub use rate_limit::{AdaptiveThrottle, TokenBucketLimiter};
pub use reliability::{AdmissionPermit, AdmissionQueue};
pub use resilience::{CircuitBreaker, RetryExecutor, RetryPolicy};
