use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::api_routes;

use super::AppState;

pub fn create_app(state: AppState) -> Router {
    api_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::{NotifierConfig, Settings};
    use crate::notifier::NotificationBus;
    use crate::queue::memory_backends;

    fn state() -> AppState {
        let backends = memory_backends();
        let bus = NotificationBus::new(backends.subscriber, NotifierConfig::default());
        AppState::new(Arc::new(Settings::default()), backends.store, bus)
    }

    #[tokio::test]
    async fn test_health_reports_memory_backend() {
        let response = create_app(state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["cache"]["backend"], "memory");
        assert_eq!(json["notifier"]["attached_listeners"], 0);
        assert!(json.get("redis").is_none());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = create_app(state())
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
