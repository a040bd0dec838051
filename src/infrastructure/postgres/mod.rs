//! PostgreSQL connection pooling for the durable message store.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
