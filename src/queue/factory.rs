//! Cache backend factory

use std::sync::Arc;

use crate::config::Settings;
use crate::notifier::{KeyspaceSubscriber, LocalKeyspaceSubscriber, RedisKeyspaceSubscriber};
use crate::redis::RedisPool;

use super::memory_store::MemoryQueueStore;
use super::redis_store::RedisQueueStore;
use super::store::{QueueStore, QueueStoreConfig};

/// A queue store paired with the keyspace subscriber that observes it.
pub struct CacheBackends {
    pub store: Arc<dyn QueueStore>,
    pub subscriber: Arc<dyn KeyspaceSubscriber>,
}

/// Create the queue store and its subscriber from `cache.backend`:
/// - `"redis"` (default): Lua-scripted store and per-node pub/sub, when a pool is given
/// - `"memory"`: single-process store with locally published events
pub fn create_cache_backends(settings: &Settings, redis_pool: Option<Arc<RedisPool>>) -> CacheBackends {
    let config = QueueStoreConfig::from(&settings.cache);

    match (settings.cache.backend.as_str(), redis_pool) {
        ("redis", Some(pool)) => {
            tracing::info!(
                backend = "redis",
                cluster = pool.is_cluster(),
                page_size = config.page_size,
                "Creating Redis queue store"
            );
            CacheBackends {
                store: Arc::new(RedisQueueStore::new(pool.clone(), config)),
                subscriber: Arc::new(RedisKeyspaceSubscriber::new(pool)),
            }
        }
        (backend, _) => {
            if backend == "redis" {
                tracing::warn!("Redis backend requested but no pool provided, falling back to memory");
            } else if backend != "memory" {
                tracing::warn!(backend = %backend, "Unknown cache backend, falling back to memory");
            } else {
                tracing::info!(backend = "memory", "Creating in-memory queue store");
            }
            memory_backends()
        }
    }
}

/// In-memory store wired to a local subscriber.
pub fn memory_backends() -> CacheBackends {
    let store = MemoryQueueStore::new();
    let subscriber = LocalKeyspaceSubscriber::new(store.event_sender());
    CacheBackends {
        store: Arc::new(store),
        subscriber: Arc::new(subscriber),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    #[test]
    fn test_memory_backend_selected() {
        let settings = Settings {
            cache: CacheConfig {
                backend: "memory".to_string(),
                ..CacheConfig::default()
            },
            ..Settings::default()
        };
        let backends = create_cache_backends(&settings, None);
        assert_eq!(backends.store.name(), "memory");
        assert_eq!(backends.subscriber.name(), "local");
    }

    #[test]
    fn test_redis_without_pool_falls_back() {
        let backends = create_cache_backends(&Settings::default(), None);
        assert_eq!(backends.store.name(), "memory");
    }
}
