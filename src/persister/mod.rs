//! Background handoff of idle queues to durable storage.
//!
//! - `PersistenceCoordinator`: sweep, lock, drain and release
//! - `DurableMessageStore`: where envelopes end up (PostgreSQL or memory)

mod coordinator;
mod durable;
mod factory;
mod postgres;

pub use coordinator::{
    CoordinatorConfig, PersistError, PersistOutcome, PersistenceCoordinator, SweepSummary,
};
pub use durable::{DurableMessageStore, DurableStoreError, MemoryDurableStore};
pub use factory::create_durable_store;
pub use postgres::PostgresMessageStore;
