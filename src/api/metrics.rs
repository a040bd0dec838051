//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics::{self, NotifierMetrics, RedisMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    refresh_gauges(&state);

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Gauges that are sampled rather than updated in place.
fn refresh_gauges(state: &AppState) {
    NotifierMetrics::set_listeners_attached(state.bus.listener_count());

    if let Some(pool) = &state.redis_pool {
        RedisMetrics::set_connected(pool.is_healthy());
        RedisMetrics::set_subscriber_nodes(pool.health().stats().subscriber_nodes);
    }
}
