//! Redis access for the queue cache.
//!
//! - `pool`: command connections (standalone or cluster) behind a circuit breaker
//! - `slot`: hash slot math and per-slot minimal hash tags
//! - `topology`: slot ownership used to route pub/sub subscriptions
//! - `CircuitBreaker`, `ExponentialBackoff`, `RedisHealth`: resilience helpers

mod backoff;
mod circuit_breaker;
mod health;
pub mod pool;
pub mod slot;
pub mod topology;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::{CacheConnection, PoolError, RedisPool};
pub use topology::{ClusterTopology, NodeAddress, SlotRange};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
