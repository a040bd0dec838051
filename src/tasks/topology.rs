use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::notifier::NotificationBus;

/// Background task that polls cluster slot ownership and resubscribes
/// keyspace notifications when it moves
pub struct TopologyWatcherTask {
    interval: Duration,
    bus: Arc<NotificationBus>,
    shutdown: broadcast::Receiver<()>,
}

impl TopologyWatcherTask {
    pub fn new(
        interval: Duration,
        bus: Arc<NotificationBus>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval,
            bus,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut refresh_timer = tokio::time::interval(self.interval);

        // Skip immediate first tick
        refresh_timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Topology watcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Topology watcher received shutdown signal");
                    break;
                }
                _ = refresh_timer.tick() => {
                    match self.bus.refresh_topology().await {
                        Ok(true) => tracing::info!("Cluster topology changed"),
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "Topology refresh failed"),
                    }
                }
            }
        }

        tracing::info!("Topology watcher stopped");
    }
}
