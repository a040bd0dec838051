//! Long-term envelope storage the persister hands queues off to.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use uuid::Uuid;

use crate::postgres::PostgresPoolError;
use crate::queue::{Envelope, QueueKey};

#[derive(Debug, thiserror::Error)]
pub enum DurableStoreError {
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresPoolError),

    #[error("Durable store unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination for persisted envelopes.
///
/// `persist` must be idempotent: the same envelopes may arrive again when
/// a handoff is retried after its lock expired.
#[async_trait]
pub trait DurableMessageStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store `envelopes` for `key`, returning how many were new.
    async fn persist(&self, key: &QueueKey, envelopes: &[Envelope]) -> Result<usize, DurableStoreError>;
}

/// Durable store held in process memory.
#[derive(Default)]
pub struct MemoryDurableStore {
    messages: DashMap<QueueKey, Vec<Envelope>>,
    seen: DashSet<(QueueKey, Uuid)>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelopes persisted for `key`, in arrival order.
    pub fn persisted(&self, key: &QueueKey) -> Vec<Envelope> {
        self.messages
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.seen.len()
    }
}

#[async_trait]
impl DurableMessageStore for MemoryDurableStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn persist(&self, key: &QueueKey, envelopes: &[Envelope]) -> Result<usize, DurableStoreError> {
        let mut stored = self.messages.entry(*key).or_default();
        let mut added = 0;
        for envelope in envelopes {
            if self.seen.insert((*key, envelope.server_guid)) {
                stored.push(envelope.clone());
                added += 1;
            }
        }
        Ok(added)
    }
}
