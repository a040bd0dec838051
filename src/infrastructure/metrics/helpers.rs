//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::notifier::NotificationKind;
use crate::redis::CircuitState;

use super::{
    CACHE_ENVELOPES_INSERTED, CACHE_MALFORMED_ENVELOPES, CACHE_OPERATION_ERRORS,
    CACHE_OPERATION_LATENCY, DELIVERY_ENVELOPES, DELIVERY_STALE_REMOVED, NOTIFIER_AUTO_DETACHED,
    NOTIFIER_KEYSPACE_EVENTS, NOTIFIER_LISTENERS_ATTACHED, NOTIFIER_NOTIFICATIONS,
    NOTIFIER_REMOVED_AFTER_ADD, NOTIFIER_RESUBSCRIBED_QUEUES, NOTIFIER_STALE_SUBSCRIPTIONS_PRUNED,
    NOTIFIER_TOPOLOGY_CHANGES, PERSIST_LATENCY, PERSIST_MESSAGES, PERSIST_QUEUES, PERSIST_SWEEPS,
    REDIS_CIRCUIT_BREAKER_STATE, REDIS_CONNECTION_STATUS, REDIS_RECONNECTIONS_TOTAL,
    REDIS_SUBSCRIBER_NODES,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct CacheMetrics;

impl CacheMetrics {
    pub fn observe(operation: &str, elapsed: Duration) {
        CACHE_OPERATION_LATENCY
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_error(operation: &str) {
        CACHE_OPERATION_ERRORS.with_label_values(&[operation]).inc();
    }

    pub fn record_inserted() {
        CACHE_ENVELOPES_INSERTED.inc();
    }

    pub fn record_malformed() {
        CACHE_MALFORMED_ENVELOPES.inc();
    }
}

pub struct NotifierMetrics;

impl NotifierMetrics {
    pub fn record_keyspace_event() {
        NOTIFIER_KEYSPACE_EVENTS.inc();
    }

    pub fn record_notification(kind: NotificationKind) {
        NOTIFIER_NOTIFICATIONS.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn set_listeners_attached(count: usize) {
        NOTIFIER_LISTENERS_ATTACHED.set(count as i64);
    }

    pub fn record_removed_after_add() {
        NOTIFIER_REMOVED_AFTER_ADD.inc();
    }

    pub fn record_stale_subscription_pruned() {
        NOTIFIER_STALE_SUBSCRIPTIONS_PRUNED.inc();
    }

    pub fn record_auto_detached() {
        NOTIFIER_AUTO_DETACHED.inc();
    }

    pub fn record_topology_change() {
        NOTIFIER_TOPOLOGY_CHANGES.inc();
    }

    pub fn record_resubscribed(queues: usize) {
        NOTIFIER_RESUBSCRIBED_QUEUES.inc_by(queues as u64);
    }
}

pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_delivered() {
        DELIVERY_ENVELOPES.with_label_values(&["delivered"]).inc();
    }

    pub fn record_stale_ephemeral() {
        DELIVERY_ENVELOPES
            .with_label_values(&["stale_ephemeral"])
            .inc();
    }

    pub fn record_stale_removed(count: usize) {
        DELIVERY_STALE_REMOVED.inc_by(count as u64);
    }
}

pub struct PersisterMetrics;

impl PersisterMetrics {
    pub fn record_outcome(outcome: &str) {
        PERSIST_QUEUES.with_label_values(&[outcome]).inc();
    }

    pub fn record_messages(count: usize) {
        PERSIST_MESSAGES.inc_by(count as u64);
    }

    pub fn observe_latency(elapsed: Duration) {
        PERSIST_LATENCY.observe(elapsed.as_secs_f64());
    }

    pub fn record_sweep() {
        PERSIST_SWEEPS.inc();
    }
}

pub struct RedisMetrics;

impl RedisMetrics {
    pub fn set_connected(connected: bool) {
        REDIS_CONNECTION_STATUS.set(if connected { 1 } else { 0 });
    }

    pub fn record_reconnection() {
        REDIS_RECONNECTIONS_TOTAL.inc();
    }

    pub fn set_circuit_state(breaker: &str, state: CircuitState) {
        REDIS_CIRCUIT_BREAKER_STATE
            .with_label_values(&[breaker])
            .set(state as i64);
    }

    pub fn set_subscriber_nodes(nodes: usize) {
        REDIS_SUBSCRIBER_NODES.set(nodes as i64);
    }
}
