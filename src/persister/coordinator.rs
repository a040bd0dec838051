//! Handoff of idle queues to durable storage.
//!
//! A queue moves Clean -> Dirty on insert, Dirty -> Locked when a sweep
//! takes its persist lock, and back to Clean once the handoff drains it.
//! A handoff that fails or runs out of time leaves the lock to expire and
//! the dirty entry in place, so a later sweep picks the queue up again.
//! Entries that cannot be decoded are discarded once a handoff reads the
//! queue to its end.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{CacheConfig, PersisterConfig};
use crate::metrics::PersisterMetrics;
use crate::queue::{QueueKey, QueueStore, QueueStoreError};

use super::durable::{DurableMessageStore, DurableStoreError};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Queue store error: {0}")]
    Store(#[from] QueueStoreError),

    #[error("Durable store error: {0}")]
    Durable(#[from] DurableStoreError),

    #[error("Durable store did not acknowledge within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub page_size: usize,
    pub lock_ttl: Duration,
    pub idle_threshold: Duration,
    pub batch_limit: usize,
    pub max_rounds: usize,
}

impl CoordinatorConfig {
    pub fn from_settings(cache: &CacheConfig, persister: &PersisterConfig) -> Self {
        Self {
            page_size: cache.page_size.max(1),
            lock_ttl: Duration::from_secs(cache.persist_lock_ttl_seconds.max(1)),
            idle_threshold: Duration::from_secs(persister.idle_threshold_seconds),
            batch_limit: persister.batch_limit.max(1),
            max_rounds: persister.max_rounds_per_sweep.max(1),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from_settings(&CacheConfig::default(), &PersisterConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// `count` envelopes handed off; `complete` when the queue was read to
    /// its end before the time budget ran out
    Persisted { count: usize, complete: bool },
    /// Nothing was handed off; `discarded` undecodable entries were dropped
    /// along with the queue's dirty entry
    Emptied { discarded: usize },
    /// Another persister holds the lock
    Contended,
}

/// Result of paging one locked queue into the durable store.
#[derive(Debug, Clone, Copy, Default)]
struct Handoff {
    persisted: usize,
    discarded: usize,
    complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub slot: u16,
    pub rounds: usize,
    pub persisted_queues: usize,
    pub persisted_messages: usize,
    pub emptied: usize,
    pub contended: usize,
    pub failed: usize,
}

pub struct PersistenceCoordinator {
    store: Arc<dyn QueueStore>,
    durable: Arc<dyn DurableMessageStore>,
    config: CoordinatorConfig,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        durable: Arc<dyn DurableMessageStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            durable,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Sweep the next slot in the shared round-robin order.
    pub async fn sweep(&self) -> Result<SweepSummary, PersistError> {
        let slot = self.store.next_slot_to_persist().await?;
        self.sweep_slot(slot).await
    }

    /// Persist idle dirty queues of `slot`. Rounds repeat while a full
    /// batch comes back, up to the configured maximum.
    pub async fn sweep_slot(&self, slot: u16) -> Result<SweepSummary, PersistError> {
        let mut summary = SweepSummary {
            slot,
            ..SweepSummary::default()
        };

        while summary.rounds < self.config.max_rounds {
            let max_time = chrono::Utc::now().timestamp_millis()
                - self.config.idle_threshold.as_millis() as i64;
            let queues = self
                .store
                .queues_to_persist(slot, max_time, self.config.batch_limit)
                .await?;
            summary.rounds += 1;

            for key in &queues {
                match self.persist_queue(key).await {
                    Ok(PersistOutcome::Persisted { count, .. }) => {
                        summary.persisted_queues += 1;
                        summary.persisted_messages += count;
                    }
                    Ok(PersistOutcome::Emptied { .. }) => summary.emptied += 1,
                    Ok(PersistOutcome::Contended) => summary.contended += 1,
                    Err(_) => summary.failed += 1,
                }
            }

            if queues.len() < self.config.batch_limit {
                break;
            }
        }

        PersisterMetrics::record_sweep();
        if summary.persisted_queues > 0 || summary.emptied > 0 || summary.failed > 0 {
            tracing::debug!(
                slot = slot,
                rounds = summary.rounds,
                queues = summary.persisted_queues,
                messages = summary.persisted_messages,
                emptied = summary.emptied,
                contended = summary.contended,
                failed = summary.failed,
                "Persist sweep finished"
            );
        }
        Ok(summary)
    }

    /// Lock `key` and hand its envelopes off to the durable store.
    ///
    /// The lock is released only after envelopes were handed off; releasing
    /// it notifies any listener on the queue. When nothing was handed off or
    /// the handoff failed it is left to expire.
    #[tracing::instrument(skip(self), fields(queue = %key))]
    pub async fn persist_queue(&self, key: &QueueKey) -> Result<PersistOutcome, PersistError> {
        if !self
            .store
            .lock_queue_for_persistence(key, self.config.lock_ttl)
            .await?
        {
            PersisterMetrics::record_outcome("contended");
            tracing::debug!("Queue already being persisted");
            return Ok(PersistOutcome::Contended);
        }

        let started = Instant::now();
        match self.hand_off(key, started).await {
            Ok(handoff) if handoff.persisted == 0 => {
                PersisterMetrics::record_outcome(if handoff.complete { "emptied" } else { "partial" });
                PersisterMetrics::observe_latency(started.elapsed());
                tracing::debug!(
                    discarded = handoff.discarded,
                    complete = handoff.complete,
                    "Nothing to persist, lock left to expire"
                );
                if handoff.complete {
                    Ok(PersistOutcome::Emptied {
                        discarded: handoff.discarded,
                    })
                } else {
                    Ok(PersistOutcome::Persisted {
                        count: 0,
                        complete: false,
                    })
                }
            }
            Ok(Handoff {
                persisted: count,
                complete,
                ..
            }) => {
                self.store.unlock_queue_for_persistence(key).await?;
                PersisterMetrics::record_outcome(if complete { "persisted" } else { "partial" });
                PersisterMetrics::record_messages(count);
                PersisterMetrics::observe_latency(started.elapsed());
                tracing::debug!(count = count, complete = complete, "Queue persisted");
                Ok(PersistOutcome::Persisted { count, complete })
            }
            Err(e) => {
                PersisterMetrics::record_outcome("failed");
                tracing::warn!(error = %e, "Queue persist failed, lock left to expire");
                Err(e)
            }
        }
    }

    /// Page through the queue, persisting and then removing each page.
    /// Stops early once half the lock lifetime is used. A handoff that
    /// reaches the end discards the undecodable entries it passed, and
    /// drops the dirty entry of a queue with nothing left.
    async fn hand_off(&self, key: &QueueKey, started: Instant) -> Result<Handoff, PersistError> {
        let lock_deadline = started + self.config.lock_ttl;
        let soft_deadline = started + self.config.lock_ttl / 2;
        let mut cursor = None;
        let mut undecodable = Vec::new();
        let mut handoff = Handoff::default();

        loop {
            if Instant::now() >= soft_deadline {
                return Ok(handoff);
            }

            let mut page = self
                .store
                .page(key, cursor, self.config.page_size)
                .await?;
            let Some(next_cursor) = page.next_cursor else {
                if !undecodable.is_empty() || handoff.persisted == 0 {
                    handoff.discarded = self.store.discard(key, &undecodable).await?;
                    if handoff.discarded > 0 {
                        tracing::warn!(discarded = handoff.discarded, "Discarded undecodable envelopes");
                    }
                }
                handoff.complete = true;
                return Ok(handoff);
            };
            cursor = Some(next_cursor);
            undecodable.append(&mut page.undecodable);

            if page.envelopes.is_empty() {
                continue;
            }

            let remaining = lock_deadline.saturating_duration_since(Instant::now());
            tokio::time::timeout(remaining, self.durable.persist(key, &page.envelopes))
                .await
                .map_err(|_| PersistError::Timeout(remaining))??;

            let guids: Vec<_> = page.envelopes.iter().map(|e| e.server_guid).collect();
            self.store.remove(key, &guids).await?;
            handoff.persisted += guids.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::MemoryDurableStore;
    use crate::queue::{Envelope, MemoryQueueStore};
    use uuid::Uuid;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            page_size: 2,
            idle_threshold: Duration::ZERO,
            ..CoordinatorConfig::default()
        }
    }

    async fn queue_with(store: &MemoryQueueStore, count: usize) -> QueueKey {
        let key = QueueKey::new(Uuid::new_v4(), 1);
        for i in 0..count {
            let envelope = Envelope::builder(Uuid::new_v4())
                .content(i.to_string())
                .build();
            store.insert(&key, &envelope).await.unwrap();
        }
        key
    }

    #[tokio::test]
    async fn test_persist_drains_queue_across_pages() {
        let store = Arc::new(MemoryQueueStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = queue_with(&store, 5).await;

        let coordinator = PersistenceCoordinator::new(store.clone(), durable.clone(), config());
        let outcome = coordinator.persist_queue(&key).await.unwrap();

        assert_eq!(
            outcome,
            PersistOutcome::Persisted {
                count: 5,
                complete: true
            }
        );
        assert_eq!(durable.persisted(&key).len(), 5);
        assert!(!store.has_messages(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_queue_is_contended() {
        let store = Arc::new(MemoryQueueStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = queue_with(&store, 1).await;

        store
            .lock_queue_for_persistence(&key, Duration::from_secs(30))
            .await
            .unwrap();

        let coordinator = PersistenceCoordinator::new(store.clone(), durable.clone(), config());
        assert_eq!(
            coordinator.persist_queue(&key).await.unwrap(),
            PersistOutcome::Contended
        );
        assert_eq!(durable.total(), 0);
    }

    #[tokio::test]
    async fn test_sweep_slot_persists_idle_queues() {
        let store = Arc::new(MemoryQueueStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = queue_with(&store, 3).await;

        let coordinator = PersistenceCoordinator::new(store.clone(), durable.clone(), config());
        let summary = coordinator.sweep_slot(key.slot()).await.unwrap();

        assert_eq!(summary.persisted_queues, 1);
        assert_eq!(summary.persisted_messages, 3);
        assert_eq!(summary.rounds, 1);
        assert!(store
            .queues_to_persist(key.slot(), i64::MAX, 10)
            .await
            .unwrap()
            .is_empty());
    }

    fn lock_releases(
        events: &mut tokio::sync::broadcast::Receiver<crate::notifier::KeyspaceEvent>,
        key: &QueueKey,
    ) -> usize {
        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if event.channel == key.persist_lock_channel() && event.operation == "del" {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_undecodable_entries_are_discarded_with_the_handoff() {
        let store = Arc::new(MemoryQueueStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = queue_with(&store, 1).await;
        store.insert_raw(&key, b"not cbor".to_vec());
        let mut events = store.event_sender().subscribe();

        let coordinator = PersistenceCoordinator::new(store.clone(), durable.clone(), config());
        let first = coordinator.sweep_slot(key.slot()).await.unwrap();
        assert_eq!(first.persisted_queues, 1);
        assert_eq!(first.persisted_messages, 1);
        assert_eq!(durable.persisted(&key).len(), 1);
        assert!(!store.has_messages(&key).await.unwrap());
        assert!(store
            .queues_to_persist(key.slot(), i64::MAX, 10)
            .await
            .unwrap()
            .is_empty());

        for _ in 0..2 {
            let summary = coordinator.sweep_slot(key.slot()).await.unwrap();
            assert_eq!(summary.persisted_queues, 0);
            assert_eq!(summary.emptied, 0);
        }
        assert_eq!(lock_releases(&mut events, &key), 1);
    }

    #[tokio::test]
    async fn test_queue_of_only_undecodable_entries_is_emptied_quietly() {
        let store = Arc::new(MemoryQueueStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = QueueKey::new(Uuid::new_v4(), 1);
        let message = Envelope::builder(Uuid::new_v4()).content("a").build();
        store.insert(&key, &message).await.unwrap();
        store.insert_raw(&key, b"not cbor".to_vec());
        store.insert_raw(&key, b"still not cbor".to_vec());
        store.remove(&key, &[message.server_guid]).await.unwrap();
        let mut events = store.event_sender().subscribe();

        let coordinator = PersistenceCoordinator::new(store.clone(), durable.clone(), config());
        assert_eq!(
            coordinator.persist_queue(&key).await.unwrap(),
            PersistOutcome::Emptied { discarded: 2 }
        );
        assert!(!store.has_messages(&key).await.unwrap());
        assert_eq!(durable.total(), 0);

        let summary = coordinator.sweep_slot(key.slot()).await.unwrap();
        assert_eq!(summary.persisted_queues, 0);
        assert_eq!(summary.emptied, 0);
        assert_eq!(lock_releases(&mut events, &key), 0);
    }

    #[tokio::test]
    async fn test_dirty_entry_of_expired_queue_is_dropped() {
        let store = Arc::new(MemoryQueueStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = queue_with(&store, 2).await;
        store.expire_queue(&key);
        let mut events = store.event_sender().subscribe();

        let coordinator = PersistenceCoordinator::new(store.clone(), durable.clone(), config());
        let first = coordinator.sweep_slot(key.slot()).await.unwrap();
        assert_eq!(first.emptied, 1);
        assert_eq!(first.persisted_queues, 0);

        let second = coordinator.sweep_slot(key.slot()).await.unwrap();
        assert_eq!(second.emptied, 0);
        assert_eq!(lock_releases(&mut events, &key), 0);
    }

    #[tokio::test]
    async fn test_recent_queue_is_not_selected() {
        let store = Arc::new(MemoryQueueStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = queue_with(&store, 1).await;

        let coordinator = PersistenceCoordinator::new(
            store.clone(),
            durable.clone(),
            CoordinatorConfig {
                idle_threshold: Duration::from_secs(600),
                ..config()
            },
        );
        let summary = coordinator.sweep_slot(key.slot()).await.unwrap();

        assert_eq!(summary.persisted_queues, 0);
        assert!(store.has_messages(&key).await.unwrap());
    }
}
