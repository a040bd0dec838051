//! In-memory queue store for single-process deployments and tests.
//!
//! All state sits behind one mutex so every operation is atomic, matching
//! the script-level atomicity of the Redis store. Keyspace events are
//! published on a broadcast channel in place of server notifications.
//! Key TTLs are not modelled; persist locks do expire.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::metrics::CacheMetrics;
use crate::notifier::KeyspaceEvent;
use crate::redis::slot::SLOT_COUNT;

use super::envelope::Envelope;
use super::key::QueueKey;
use super::store::{decode_page, Page, QueueStore, QueueStoreError};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<u64, Vec<u8>>,
    sequences: HashMap<Uuid, u64>,
    counter: u64,
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<QueueKey, QueueState>,
    /// slot -> queue -> first time marked dirty (ms)
    dirty: HashMap<u16, HashMap<QueueKey, i64>>,
    locks: HashMap<QueueKey, Instant>,
    persist_slot: u64,
}

impl MemoryState {
    fn lock_held(&mut self, key: &QueueKey) -> bool {
        match self.locks.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                self.locks.remove(key);
                false
            }
            None => false,
        }
    }

    fn unmark_dirty(&mut self, key: &QueueKey) {
        let slot = key.slot();
        if let Some(index) = self.dirty.get_mut(&slot) {
            index.remove(key);
            if index.is_empty() {
                self.dirty.remove(&slot);
            }
        }
    }
}

pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<KeyspaceEvent>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
        }
    }

    /// Sender the local keyspace subscriber listens on.
    pub fn event_sender(&self) -> broadcast::Sender<KeyspaceEvent> {
        self.events.clone()
    }

    /// Number of envelopes currently queued.
    pub fn len(&self, key: &QueueKey) -> usize {
        self.state()
            .queues
            .get(key)
            .map(|queue| queue.entries.len())
            .unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, channel: String, operation: &str) {
        // No receivers is fine: nobody is attached.
        let _ = self.events.send(KeyspaceEvent::new(channel, operation));
    }

    /// Store raw bytes under the next sequence, bypassing the codec.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &QueueKey, bytes: Vec<u8>) -> u64 {
        let mut state = self.state();
        let queue = state.queues.entry(*key).or_default();
        queue.counter += 1;
        let sequence = queue.counter;
        queue.entries.insert(sequence, bytes);
        sequence
    }

    /// Drop the queue's entries and metadata but keep its dirty entry,
    /// the state Redis is left in when the queue's keys expire.
    #[cfg(test)]
    pub(crate) fn expire_queue(&self, key: &QueueKey) {
        self.state().queues.remove(key);
    }
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, key: &QueueKey, envelope: &Envelope) -> Result<u64, QueueStoreError> {
        let bytes = envelope.encode()?;
        let now = chrono::Utc::now().timestamp_millis();

        let sequence = {
            let mut state = self.state();
            let queue = state.queues.entry(*key).or_default();
            if let Some(existing) = queue.sequences.get(&envelope.server_guid) {
                return Ok(*existing);
            }

            queue.counter += 1;
            let sequence = queue.counter;
            queue.entries.insert(sequence, bytes);
            queue.sequences.insert(envelope.server_guid, sequence);

            state
                .dirty
                .entry(key.slot())
                .or_default()
                .entry(*key)
                .or_insert(now);
            sequence
        };

        CacheMetrics::record_inserted();
        self.publish(key.queue_channel(), "zadd");
        Ok(sequence)
    }

    async fn remove(&self, key: &QueueKey, guids: &[Uuid]) -> Result<Vec<Envelope>, QueueStoreError> {
        let removed: Vec<Vec<u8>> = {
            let mut state = self.state();
            let Some(queue) = state.queues.get_mut(key) else {
                return Ok(Vec::new());
            };

            let removed: Vec<Vec<u8>> = guids
                .iter()
                .filter_map(|guid| queue.sequences.remove(guid))
                .filter_map(|sequence| queue.entries.remove(&sequence))
                .collect();

            if queue.entries.is_empty() {
                state.unmark_dirty(key);
            }
            removed
        };

        if !removed.is_empty() {
            self.publish(key.queue_channel(), "zremrangebyscore");
        }

        Ok(removed
            .into_iter()
            .filter_map(|bytes| match Envelope::decode(&bytes) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    CacheMetrics::record_malformed();
                    tracing::warn!(queue = %key, error = %e, "Removed a malformed envelope");
                    None
                }
            })
            .collect())
    }

    async fn has_messages(&self, key: &QueueKey) -> Result<bool, QueueStoreError> {
        Ok(self.len(key) > 0)
    }

    async fn page(
        &self,
        key: &QueueKey,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Page, QueueStoreError> {
        let (entries, persist_in_progress) = {
            let mut state = self.state();
            let persist_in_progress = state.lock_held(key);
            let entries: Vec<(Vec<u8>, u64)> = match state.queues.get(key) {
                Some(queue) => {
                    let lower = after.map(|s| s.saturating_add(1)).unwrap_or(0);
                    queue
                        .entries
                        .range(lower..)
                        .take(limit.max(1))
                        .map(|(sequence, bytes)| (bytes.clone(), *sequence))
                        .collect()
                }
                None => Vec::new(),
            };
            (entries, persist_in_progress)
        };

        Ok(decode_page(key, entries, persist_in_progress))
    }

    async fn clear(&self, key: &QueueKey) -> Result<(), QueueStoreError> {
        let existed = {
            let mut state = self.state();
            state.unmark_dirty(key);
            state.queues.remove(key).is_some()
        };
        if existed {
            self.publish(key.queue_channel(), "del");
        }
        Ok(())
    }

    async fn discard(&self, key: &QueueKey, sequences: &[u64]) -> Result<usize, QueueStoreError> {
        let removed = {
            let mut state = self.state();
            let (removed, empty) = match state.queues.get_mut(key) {
                Some(queue) => {
                    let removed = sequences
                        .iter()
                        .filter(|sequence| queue.entries.remove(sequence).is_some())
                        .count();
                    queue
                        .sequences
                        .retain(|_, sequence| !sequences.contains(sequence));
                    (removed, queue.entries.is_empty())
                }
                None => (0, true),
            };
            if empty {
                state.unmark_dirty(key);
            }
            removed
        };

        if removed > 0 {
            self.publish(key.queue_channel(), "zremrangebyscore");
        }
        Ok(removed)
    }

    async fn next_slot_to_persist(&self) -> Result<u16, QueueStoreError> {
        let mut state = self.state();
        state.persist_slot += 1;
        Ok((state.persist_slot % SLOT_COUNT as u64) as u16)
    }

    async fn queues_to_persist(
        &self,
        slot: u16,
        max_time_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueKey>, QueueStoreError> {
        let state = self.state();
        let Some(index) = state.dirty.get(&slot) else {
            return Ok(Vec::new());
        };

        let mut candidates: Vec<(i64, QueueKey)> = index
            .iter()
            .filter(|(_, marked_at)| (0..=max_time_ms).contains(*marked_at))
            .map(|(key, marked_at)| (*marked_at, *key))
            .collect();
        candidates.sort();

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|(_, key)| key)
            .collect())
    }

    async fn lock_queue_for_persistence(
        &self,
        key: &QueueKey,
        ttl: Duration,
    ) -> Result<bool, QueueStoreError> {
        let mut state = self.state();
        if state.lock_held(key) {
            return Ok(false);
        }
        state.locks.insert(*key, Instant::now() + ttl);
        Ok(true)
    }

    async fn unlock_queue_for_persistence(&self, key: &QueueKey) -> Result<(), QueueStoreError> {
        let released = {
            let mut state = self.state();
            let held = state.lock_held(key);
            state.locks.remove(key);
            held
        };
        if released {
            self.publish(key.persist_lock_channel(), "del");
        }
        Ok(())
    }
}
