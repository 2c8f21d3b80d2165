//! Response caching.

pub mod cache;

pub use cache::{CacheLayer, CachedValue};
