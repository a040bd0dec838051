//! Durable store factory

use std::sync::Arc;

use crate::config::PersisterConfig;
use crate::postgres::PostgresPool;

use super::durable::{DurableMessageStore, DurableStoreError, MemoryDurableStore};
use super::postgres::PostgresMessageStore;

/// Create the durable store named by `persister.durable_backend`:
/// - `"postgres"` (default): requires a pool; the table is created if missing
/// - `"memory"`: process-local, for development and tests
pub async fn create_durable_store(
    settings: &PersisterConfig,
    postgres_pool: Option<PostgresPool>,
) -> Result<Arc<dyn DurableMessageStore>, DurableStoreError> {
    match (settings.durable_backend.as_str(), postgres_pool) {
        ("postgres", Some(pool)) => {
            tracing::info!(backend = "postgres", "Creating PostgreSQL durable store");
            let store = PostgresMessageStore::new(pool);
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        ("postgres", None) => {
            tracing::warn!("PostgreSQL durable store requested but no pool provided, falling back to memory");
            Ok(Arc::new(MemoryDurableStore::new()))
        }
        (backend, _) => {
            if backend != "memory" {
                tracing::warn!(backend = %backend, "Unknown durable backend, falling back to memory");
            } else {
                tracing::info!(backend = "memory", "Creating in-memory durable store");
            }
            Ok(Arc::new(MemoryDurableStore::new()))
        }
    }
}
