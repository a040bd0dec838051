use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::notifier::NotificationBus;
use crate::postgres::PostgresPool;
use crate::queue::QueueStore;
use crate::redis::RedisPool;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn QueueStore>,
    pub bus: Arc<NotificationBus>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub postgres_pool: Option<PostgresPool>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn QueueStore>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            settings,
            store,
            bus,
            redis_pool: None,
            postgres_pool: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_redis(mut self, pool: Option<Arc<RedisPool>>) -> Self {
        self.redis_pool = pool;
        self
    }

    pub fn with_postgres(mut self, pool: Option<PostgresPool>) -> Self {
        self.postgres_pool = pool;
        self
    }
}
