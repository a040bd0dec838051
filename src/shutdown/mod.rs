//! Graceful shutdown handling for the message cache.
//!
//! Shutdown runs in phases: background tasks are signalled and awaited,
//! an optional final persist sweep runs, then keyspace notifications stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::notifier::NotificationBus;
use crate::persister::PersistenceCoordinator;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for background tasks to stop (default: 10 seconds)
    pub task_timeout: Duration,
    /// Time allowed for the final persist sweep (default: 15 seconds)
    pub flush_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(15),
        }
    }
}

/// Handles graceful shutdown of the message cache
pub struct GracefulShutdown {
    bus: Arc<NotificationBus>,
    coordinator: Option<Arc<PersistenceCoordinator>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(bus: Arc<NotificationBus>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            bus,
            coordinator: None,
            shutdown_tx,
            tasks: Vec::new(),
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ShutdownConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one last persist sweep before stopping.
    pub fn with_final_sweep(mut self, coordinator: Arc<PersistenceCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Track a background task so shutdown waits for it.
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(attached_listeners = self.bus.listener_count())
    )]
    pub async fn execute(self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        // Phase 1: Signal background tasks to stop
        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling background tasks");
        let _ = self.shutdown_tx.send(());
        result.tasks_stopped = self.wait_for_tasks().await;

        // Phase 2: Final persist sweep
        if let Some(coordinator) = &self.coordinator {
            tracing::info!("Phase 2: Running final persist sweep");
            result.messages_flushed = self.final_sweep(coordinator).await;
        }

        // Phase 3: Stop keyspace notifications
        tracing::info!("Phase 3: Stopping notification bus");
        self.bus.stop().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            tasks_stopped = result.tasks_stopped,
            messages_flushed = result.messages_flushed,
            duration_ms = result.duration.as_millis(),
            "Graceful shutdown completed"
        );

        result
    }

    async fn wait_for_tasks(&self) -> usize {
        let total = self.tasks.len();
        if total == 0 {
            return 0;
        }

        let wait = async {
            loop {
                if self.tasks.iter().all(|h| h.is_finished()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        if timeout(self.config.task_timeout, wait).await.is_err() {
            let remaining = self.tasks.iter().filter(|h| !h.is_finished()).count();
            tracing::warn!(
                remaining_tasks = remaining,
                "Background tasks did not stop in time, aborting"
            );
            for handle in &self.tasks {
                handle.abort();
            }
        }

        let stopped = self.tasks.iter().filter(|h| h.is_finished()).count();
        tracing::debug!(stopped = stopped, total = total, "Background tasks stopped");
        stopped
    }

    async fn final_sweep(&self, coordinator: &PersistenceCoordinator) -> usize {
        match timeout(self.config.flush_timeout, coordinator.sweep()).await {
            Ok(Ok(summary)) => summary.persisted_messages,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Final persist sweep failed");
                0
            }
            Err(_) => {
                tracing::warn!("Final persist sweep timed out, queues remain cached");
                0
            }
        }
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Background tasks that finished before the deadline
    pub tasks_stopped: usize,
    /// Envelopes handed off by the final sweep
    pub messages_flushed: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifierConfig;
    use crate::queue::memory_backends;

    #[tokio::test]
    async fn test_shutdown_stops_tracked_tasks() {
        let backends = memory_backends();
        let bus = NotificationBus::new(backends.subscriber, NotifierConfig::default());
        bus.start().await.unwrap();

        let (tx, mut rx) = broadcast::channel(1);
        let mut shutdown = GracefulShutdown::new(bus, tx);
        shutdown.track(tokio::spawn(async move {
            let _ = rx.recv().await;
        }));

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.tasks_stopped, 1);
        assert_eq!(result.messages_flushed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_aborted() {
        let backends = memory_backends();
        let bus = NotificationBus::new(backends.subscriber, NotifierConfig::default());

        let (tx, _) = broadcast::channel(1);
        let mut shutdown = GracefulShutdown::new(bus, tx).with_config(ShutdownConfig {
            task_timeout: Duration::from_millis(200),
            ..ShutdownConfig::default()
        });
        shutdown.track(tokio::spawn(std::future::pending::<()>()));

        let result = shutdown.execute("test shutdown").await;
        assert!(result.success);
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.task_timeout, Duration::from_secs(10));
        assert_eq!(config.flush_timeout, Duration::from_secs(15));
    }
}
