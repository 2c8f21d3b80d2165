//! Token bucket rate limiting with adaptive per-endpoint limits.

pub mod adaptive;
pub mod token_bucket;

pub use adaptive::{AdaptiveThrottle, EndpointThrottleState, ThrottleUpdate};
pub use token_bucket::{Acquire, TokenBucketLimiter, TokenBucketState};
