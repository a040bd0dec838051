//! Health endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::redis::RedisHealthStatus;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub cache: CacheHealthResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
    pub notifier: NotifierHealthResponse,
    pub persister: PersisterHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct CacheHealthResponse {
    pub backend: String,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub status: String,
    pub connected: bool,
    pub cluster: bool,
    pub circuit_breaker_state: String,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
    pub subscriber_nodes: usize,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub connected: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct NotifierHealthResponse {
    pub subscriber: String,
    pub attached_listeners: usize,
}

#[derive(Debug, Serialize)]
pub struct PersisterHealthResponse {
    pub enabled: bool,
    pub durable_backend: String,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let redis = state.redis_pool.as_ref().map(|pool| {
        let stats = pool.health().stats();
        RedisHealthResponse {
            status: stats.status.as_str().to_string(),
            connected: stats.status == RedisHealthStatus::Healthy,
            cluster: pool.is_cluster(),
            circuit_breaker_state: pool.circuit_state().as_str().to_string(),
            reconnection_attempts: stats.reconnection_attempts,
            total_reconnections: stats.total_reconnections,
            subscriber_nodes: stats.subscriber_nodes,
        }
    });

    let postgres = state.postgres_pool.as_ref().map(|pool| {
        let inner = pool.pool();
        PostgresHealthResponse {
            connected: pool.is_available(),
            pool_size: inner.size(),
            idle_connections: inner.num_idle() as u32,
        }
    });

    let degraded = redis.as_ref().is_some_and(|r| !r.connected)
        || postgres.as_ref().is_some_and(|p| !p.connected);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        cache: CacheHealthResponse {
            backend: state.store.name().to_string(),
        },
        redis,
        postgres,
        notifier: NotifierHealthResponse {
            subscriber: state.bus.subscriber_name().to_string(),
            attached_listeners: state.bus.listener_count(),
        },
        persister: PersisterHealthResponse {
            enabled: state.settings.persister.enabled,
            durable_backend: state.settings.persister.durable_backend.clone(),
        },
    })
}
