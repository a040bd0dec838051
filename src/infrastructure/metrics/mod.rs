//! Prometheus metrics for the message cache.
//!
//! - Cache operation latency and errors, malformed envelopes
//! - Keyspace notifications, listener bookkeeping and topology changes
//! - Delivery outcomes and stale ephemeral cleanup
//! - Persistence handoff outcomes
//! - Redis connectivity and circuit breaker state

mod helpers;

pub use helpers::{
    encode_metrics, CacheMetrics, DeliveryMetrics, NotifierMetrics, PersisterMetrics, RedisMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara";

lazy_static! {
    // ============================================================================
    // Cache Metrics
    // ============================================================================

    pub static ref CACHE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_cache_operation_latency_seconds", METRIC_PREFIX),
        "Queue cache operation latency in seconds",
        &["operation"],
        vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0]
    ).unwrap();

    pub static ref CACHE_OPERATION_ERRORS: IntCounterVec = register_int_counter_vec!(
        format!("{}_cache_operation_errors_total", METRIC_PREFIX),
        "Queue cache operation failures",
        &["operation"]
    ).unwrap();

    pub static ref CACHE_ENVELOPES_INSERTED: IntCounter = register_int_counter!(
        format!("{}_cache_envelopes_inserted_total", METRIC_PREFIX),
        "Envelopes inserted into device queues"
    ).unwrap();

    pub static ref CACHE_MALFORMED_ENVELOPES: IntCounter = register_int_counter!(
        format!("{}_cache_malformed_envelopes_total", METRIC_PREFIX),
        "Stored envelopes skipped because they could not be decoded"
    ).unwrap();

    // ============================================================================
    // Notifier Metrics
    // ============================================================================

    pub static ref NOTIFIER_KEYSPACE_EVENTS: IntCounter = register_int_counter!(
        format!("{}_notifier_keyspace_events_total", METRIC_PREFIX),
        "Keyspace events received from the cache"
    ).unwrap();

    pub static ref NOTIFIER_NOTIFICATIONS: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifier_notifications_total", METRIC_PREFIX),
        "Listener notifications dispatched",
        &["kind"]
    ).unwrap();

    pub static ref NOTIFIER_LISTENERS_ATTACHED: IntGauge = register_int_gauge!(
        format!("{}_notifier_listeners_attached", METRIC_PREFIX),
        "Queues with an attached delivery listener"
    ).unwrap();

    pub static ref NOTIFIER_REMOVED_AFTER_ADD: IntCounter = register_int_counter!(
        format!("{}_notifier_listener_removed_after_add_total", METRIC_PREFIX),
        "Detaches that found the queue already bound to a newer listener"
    ).unwrap();

    pub static ref NOTIFIER_STALE_SUBSCRIPTIONS_PRUNED: IntCounter = register_int_counter!(
        format!("{}_notifier_stale_subscriptions_pruned_total", METRIC_PREFIX),
        "Subscriptions dropped because no listener was bound"
    ).unwrap();

    pub static ref NOTIFIER_AUTO_DETACHED: IntCounter = register_int_counter!(
        format!("{}_notifier_auto_detached_total", METRIC_PREFIX),
        "Listeners detached after declining further notifications"
    ).unwrap();

    pub static ref NOTIFIER_TOPOLOGY_CHANGES: IntCounter = register_int_counter!(
        format!("{}_notifier_topology_changes_total", METRIC_PREFIX),
        "Cluster topology changes or pub/sub reconnects observed"
    ).unwrap();

    pub static ref NOTIFIER_RESUBSCRIBED_QUEUES: IntCounter = register_int_counter!(
        format!("{}_notifier_resubscribed_queues_total", METRIC_PREFIX),
        "Queue subscriptions re-established after topology changes"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    pub static ref DELIVERY_ENVELOPES: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_envelopes_total", METRIC_PREFIX),
        "Envelopes read by delivery streams",
        &["outcome"]
    ).unwrap();

    pub static ref DELIVERY_STALE_REMOVED: IntCounter = register_int_counter!(
        format!("{}_delivery_stale_ephemeral_removed_total", METRIC_PREFIX),
        "Expired ephemeral envelopes removed from queues"
    ).unwrap();

    // ============================================================================
    // Persistence Metrics
    // ============================================================================

    pub static ref PERSIST_QUEUES: IntCounterVec = register_int_counter_vec!(
        format!("{}_persist_queues_total", METRIC_PREFIX),
        "Queue handoffs to durable storage by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref PERSIST_MESSAGES: IntCounter = register_int_counter!(
        format!("{}_persist_messages_total", METRIC_PREFIX),
        "Envelopes handed off to durable storage"
    ).unwrap();

    pub static ref PERSIST_LATENCY: Histogram = register_histogram!(
        format!("{}_persist_queue_latency_seconds", METRIC_PREFIX),
        "Time to hand off one queue",
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]
    ).unwrap();

    pub static ref PERSIST_SWEEPS: IntCounter = register_int_counter!(
        format!("{}_persist_sweeps_total", METRIC_PREFIX),
        "Persistence sweeps executed"
    ).unwrap();

    // ============================================================================
    // Redis Metrics
    // ============================================================================

    pub static ref REDIS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_redis_connection_status", METRIC_PREFIX),
        "Redis connection status (1=connected, 0=disconnected)"
    ).unwrap();

    pub static ref REDIS_CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["breaker"]
    ).unwrap();

    pub static ref REDIS_RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_redis_reconnections_total", METRIC_PREFIX),
        "Total Redis reconnection attempts"
    ).unwrap();

    pub static ref REDIS_SUBSCRIBER_NODES: IntGauge = register_int_gauge!(
        format!("{}_redis_subscriber_nodes", METRIC_PREFIX),
        "Nodes with an established keyspace pub/sub connection"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        CACHE_ENVELOPES_INSERTED.inc();

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_cache_envelopes_inserted_total"));
    }

    #[test]
    fn test_labelled_metrics() {
        CACHE_OPERATION_LATENCY.with_label_values(&["insert"]).observe(0.001);
        NOTIFIER_NOTIFICATIONS.with_label_values(&["new_messages"]).inc();
        PERSIST_QUEUES.with_label_values(&["contended"]).inc();
        REDIS_CIRCUIT_BREAKER_STATE.with_label_values(&["redis"]).set(0);
    }
}
