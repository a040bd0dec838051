//! Infrastructure layer modules
//!
//! - `config`: layered settings
//! - `error`: HTTP-facing error type
//! - `metrics`: Prometheus registry and helpers
//! - `postgres`: PostgreSQL pool for the durable store
//! - `redis`: Redis pool, circuit breaker, backoff, health and cluster topology

pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
