//! Cache connectivity tracking for the command pool and pub/sub drivers

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::metrics::RedisMetrics;

use super::current_time_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RedisHealthStatus {
    Healthy = 0,
    Reconnecting = 1,
    CircuitOpen = 2,
}

impl RedisHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedisHealthStatus::Healthy => "healthy",
            RedisHealthStatus::Reconnecting => "reconnecting",
            RedisHealthStatus::CircuitOpen => "circuit_open",
        }
    }
}

impl From<u8> for RedisHealthStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => RedisHealthStatus::Healthy,
            2 => RedisHealthStatus::CircuitOpen,
            _ => RedisHealthStatus::Reconnecting,
        }
    }
}

/// Health of the command connection plus a count of pub/sub node
/// connections currently established.
pub struct RedisHealth {
    status: AtomicU8,
    last_connected: AtomicI64,
    reconnection_attempts: AtomicU32,
    total_reconnections: AtomicU32,
    subscriber_nodes: AtomicUsize,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RedisHealthStatus::Reconnecting as u8),
            last_connected: AtomicI64::new(0),
            reconnection_attempts: AtomicU32::new(0),
            total_reconnections: AtomicU32::new(0),
            subscriber_nodes: AtomicUsize::new(0),
        }
    }

    pub fn set_connected(&self) {
        let previous = self
            .status
            .swap(RedisHealthStatus::Healthy as u8, Ordering::AcqRel);
        let connected_before = self
            .last_connected
            .swap(current_time_ms(), Ordering::AcqRel)
            != 0;
        if previous != RedisHealthStatus::Healthy as u8 && connected_before {
            self.total_reconnections.fetch_add(1, Ordering::AcqRel);
        }
        self.reconnection_attempts.store(0, Ordering::Release);
        RedisMetrics::set_connected(true);
    }

    pub fn set_reconnecting(&self) {
        self.status
            .store(RedisHealthStatus::Reconnecting as u8, Ordering::Release);
        self.reconnection_attempts.fetch_add(1, Ordering::AcqRel);
        RedisMetrics::set_connected(false);
        RedisMetrics::record_reconnection();
    }

    pub fn set_circuit_open(&self) {
        self.status
            .store(RedisHealthStatus::CircuitOpen as u8, Ordering::Release);
        RedisMetrics::set_connected(false);
    }

    pub fn subscriber_connected(&self) {
        let nodes = self.subscriber_nodes.fetch_add(1, Ordering::AcqRel) + 1;
        RedisMetrics::set_subscriber_nodes(nodes);
    }

    pub fn subscriber_disconnected(&self) {
        let nodes = self
            .subscriber_nodes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map(|n| n.saturating_sub(1))
            .unwrap_or(0);
        RedisMetrics::set_subscriber_nodes(nodes);
    }

    pub fn status(&self) -> RedisHealthStatus {
        RedisHealthStatus::from(self.status.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == RedisHealthStatus::Healthy
    }

    pub fn stats(&self) -> RedisHealthStats {
        RedisHealthStats {
            status: self.status(),
            last_connected_ms: self.last_connected.load(Ordering::Acquire),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::Acquire),
            total_reconnections: self.total_reconnections.load(Ordering::Acquire),
            subscriber_nodes: self.subscriber_nodes.load(Ordering::Acquire),
        }
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RedisHealthStats {
    pub status: RedisHealthStatus,
    pub last_connected_ms: i64,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
    pub subscriber_nodes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let health = RedisHealth::new();
        assert_eq!(health.status(), RedisHealthStatus::Reconnecting);

        health.set_connected();
        assert!(health.is_healthy());

        health.set_circuit_open();
        assert_eq!(health.status().as_str(), "circuit_open");
    }

    #[test]
    fn test_subscriber_node_count_never_underflows() {
        let health = RedisHealth::new();
        health.subscriber_connected();
        health.subscriber_connected();
        health.subscriber_disconnected();
        health.subscriber_disconnected();
        health.subscriber_disconnected();
        assert_eq!(health.stats().subscriber_nodes, 0);
    }

    #[test]
    fn test_reconnect_counted_after_drop() {
        let health = RedisHealth::new();
        health.set_reconnecting();
        health.set_connected();
        assert_eq!(health.stats().total_reconnections, 0);

        health.set_reconnecting();
        health.set_connected();
        let stats = health.stats();
        assert_eq!(stats.total_reconnections, 1);
        assert_eq!(stats.reconnection_attempts, 0);
    }
}
