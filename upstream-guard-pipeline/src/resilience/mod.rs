//! Failure isolation and retry around upstream calls.
//!
//! - **Circuit Breaker**: stops calling an endpoint that keeps failing
//! - **Retry**: bounded exponential backoff with jitter for transient failures

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerState, BreakerTicket, CircuitBreaker, CircuitBreakerError, CircuitBreakerStats,
};
pub use retry::{AttemptError, Classification, RetryAttemptContext, RetryExecutor, RetryPolicy};
