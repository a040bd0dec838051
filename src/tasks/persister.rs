use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;

use crate::config::PersisterConfig;
use crate::persister::{PersistenceCoordinator, SweepSummary};

/// Background task that sweeps dirty queues into durable storage
pub struct PersisterTask {
    config: PersisterConfig,
    coordinator: Arc<PersistenceCoordinator>,
    shutdown: broadcast::Receiver<()>,
}

impl PersisterTask {
    pub fn new(
        config: PersisterConfig,
        coordinator: Arc<PersistenceCoordinator>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            coordinator,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut sweep_timer =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms.max(1)));
        sweep_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip immediate first tick
        sweep_timer.tick().await;

        tracing::info!(
            workers = self.config.worker_count,
            sweep_interval_ms = self.config.sweep_interval_ms,
            idle_threshold_secs = self.config.idle_threshold_seconds,
            "Persister task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Persister task received shutdown signal");
                    break;
                }
                _ = sweep_timer.tick() => {
                    self.sweep_once().await;
                }
            }
        }

        tracing::info!("Persister task stopped");
    }

    /// Run one sweep per worker concurrently; each takes its own slot.
    pub async fn sweep_once(&self) -> Vec<SweepSummary> {
        let start = Instant::now();
        let sweeps = (0..self.config.worker_count.max(1)).map(|_| self.coordinator.sweep());

        let mut summaries = Vec::new();
        for result in join_all(sweeps).await {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!(error = %e, "Persist sweep failed"),
            }
        }

        let messages: usize = summaries.iter().map(|s| s.persisted_messages).sum();
        if messages > 0 {
            tracing::info!(
                messages = messages,
                duration_ms = start.elapsed().as_millis() as u64,
                "Persisted queued messages"
            );
        }
        summaries
    }
}
