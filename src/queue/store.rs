use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::metrics::CacheMetrics;
use crate::redis::PoolError;

use super::envelope::{Envelope, EnvelopeCodecError};
use super::key::QueueKey;

#[derive(Debug, thiserror::Error)]
pub enum QueueStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] PoolError),

    #[error("Envelope codec error: {0}")]
    Codec(#[from] EnvelopeCodecError),

    #[error("Unexpected cache reply: {0}")]
    Protocol(String),
}

impl QueueStoreError {
    /// Connectivity failures are retryable; encoding and protocol errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueStoreError::Redis(e) => e.is_retryable(),
            QueueStoreError::Codec(_) | QueueStoreError::Protocol(_) => false,
        }
    }
}

/// One page of a queue read.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Decoded envelopes in sequence order; malformed entries are omitted
    pub envelopes: Vec<Envelope>,
    /// Sequence of the last entry read, `None` once the queue is exhausted
    pub next_cursor: Option<u64>,
    /// A persistence handoff held the queue's lock at read time
    pub persist_in_progress: bool,
    /// Sequences of entries that failed to decode
    pub undecodable: Vec<u64>,
}

impl Page {
    pub fn is_end(&self) -> bool {
        self.next_cursor.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct QueueStoreConfig {
    pub page_size: usize,
    pub queue_ttl: Duration,
    pub persist_lock_ttl: Duration,
    pub max_ephemeral_delay: Duration,
    pub deletion_batch_size: usize,
}

impl Default for QueueStoreConfig {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl From<&CacheConfig> for QueueStoreConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            queue_ttl: Duration::from_secs(config.queue_ttl_seconds),
            persist_lock_ttl: Duration::from_secs(config.persist_lock_ttl_seconds),
            max_ephemeral_delay: Duration::from_millis(config.max_ephemeral_delay_ms),
            deletion_batch_size: config.deletion_batch_size.max(1),
        }
    }
}

/// Per-device ordered envelope queue.
///
/// Every operation is atomic with respect to the queue's keys. Sequence
/// numbers are assigned by the store, strictly increase, and are never
/// reused while the queue's metadata lives.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Backend name for logs and health output
    fn name(&self) -> &'static str;

    /// Append an envelope and mark the queue dirty. Re-inserting a guid
    /// already queued returns its existing sequence.
    async fn insert(&self, key: &QueueKey, envelope: &Envelope) -> Result<u64, QueueStoreError>;

    /// Remove envelopes by guid, returning those that were present.
    async fn remove(&self, key: &QueueKey, guids: &[Uuid]) -> Result<Vec<Envelope>, QueueStoreError>;

    async fn has_messages(&self, key: &QueueKey) -> Result<bool, QueueStoreError>;

    /// Up to `limit` entries with sequence strictly greater than `after`.
    async fn page(
        &self,
        key: &QueueKey,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Page, QueueStoreError>;

    /// Drop the queue, its metadata and its dirty entry.
    async fn clear(&self, key: &QueueKey) -> Result<(), QueueStoreError>;

    /// Drop entries by sequence, returning how many were present. The
    /// dirty entry goes once the queue is empty, also when the queue's
    /// keys have already expired.
    async fn discard(&self, key: &QueueKey, sequences: &[u64]) -> Result<usize, QueueStoreError>;

    /// Round-robin slot cursor shared by all persisters.
    async fn next_slot_to_persist(&self) -> Result<u16, QueueStoreError>;

    /// Dirty queues in `slot` first marked at or before `max_time_ms`,
    /// oldest first. Entries stay in the index.
    async fn queues_to_persist(
        &self,
        slot: u16,
        max_time_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueKey>, QueueStoreError>;

    /// Take the queue's persist lock; `false` when someone else holds it.
    async fn lock_queue_for_persistence(
        &self,
        key: &QueueKey,
        ttl: Duration,
    ) -> Result<bool, QueueStoreError>;

    async fn unlock_queue_for_persistence(&self, key: &QueueKey) -> Result<(), QueueStoreError>;
}

/// Decode stored entries into a page. Undecodable entries are logged,
/// counted and skipped without ending the page early.
pub(crate) fn decode_page(
    key: &QueueKey,
    entries: Vec<(Vec<u8>, u64)>,
    persist_in_progress: bool,
) -> Page {
    let next_cursor = entries.last().map(|(_, sequence)| *sequence);
    let mut envelopes = Vec::with_capacity(entries.len());
    let mut undecodable = Vec::new();

    for (bytes, sequence) in entries {
        match Envelope::decode(&bytes) {
            Ok(envelope) => envelopes.push(envelope),
            Err(e) => {
                CacheMetrics::record_malformed();
                undecodable.push(sequence);
                tracing::warn!(
                    queue = %key,
                    sequence = sequence,
                    error = %e,
                    "Skipping malformed envelope"
                );
            }
        }
    }

    Page {
        envelopes,
        next_cursor,
        persist_in_progress,
        undecodable,
    }
}
