//! Background removal of stale ephemeral envelopes.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::metrics::DeliveryMetrics;
use crate::queue::{QueueKey, QueueStore};

/// Feeds stale guids to a worker that removes them in batches.
///
/// The worker drains whatever was queued and exits once the pruner is
/// dropped; nothing waits on it.
pub struct StalePruner {
    guids: mpsc::UnboundedSender<Uuid>,
}

impl StalePruner {
    pub fn spawn(store: Arc<dyn QueueStore>, key: QueueKey, batch_size: usize) -> Self {
        let (guids, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(store, key, rx, batch_size.max(1)));
        Self { guids }
    }

    pub fn push(&self, guid: Uuid) {
        if self.guids.send(guid).is_err() {
            tracing::warn!(guid = %guid, "Stale envelope pruner is gone");
        }
    }
}

async fn run_worker(
    store: Arc<dyn QueueStore>,
    key: QueueKey,
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    batch_size: usize,
) {
    let mut batch = Vec::with_capacity(batch_size);

    while rx.recv_many(&mut batch, batch_size).await > 0 {
        match store.remove(&key, &batch).await {
            Ok(removed) => {
                DeliveryMetrics::record_stale_removed(removed.len());
                tracing::debug!(
                    queue = %key,
                    requested = batch.len(),
                    removed = removed.len(),
                    "Removed stale ephemeral envelopes"
                );
            }
            // Left in place; the next read classifies them again.
            Err(e) => {
                tracing::warn!(
                    queue = %key,
                    count = batch.len(),
                    error = %e,
                    "Failed to remove stale ephemeral envelopes"
                );
            }
        }
        batch.clear();
    }
}
