//! Redis-backed queue store.
//!
//! Multi-key mutations run as Lua scripts so the queue, its metadata and
//! the slot's dirty index change together. All keys of a queue share a
//! hash slot, which keeps the scripts valid on a cluster.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use crate::metrics::CacheMetrics;
use crate::redis::slot::SLOT_COUNT;
use crate::redis::{PoolError, RedisPool};

use super::envelope::Envelope;
use super::key::{queue_index_key, QueueKey, PERSIST_SLOT_COUNTER_KEY};
use super::store::{decode_page, Page, QueueStore, QueueStoreConfig, QueueStoreError};

const INSERT_SCRIPT: &str = include_str!("lua/insert.lua");
const REMOVE_SCRIPT: &str = include_str!("lua/remove.lua");
const GET_ITEMS_SCRIPT: &str = include_str!("lua/get_items.lua");
const REMOVE_QUEUE_SCRIPT: &str = include_str!("lua/remove_queue.lua");
const DISCARD_SCRIPT: &str = include_str!("lua/discard.lua");

pub struct RedisQueueStore {
    pool: Arc<RedisPool>,
    config: QueueStoreConfig,
    insert_script: Script,
    remove_script: Script,
    get_items_script: Script,
    remove_queue_script: Script,
    discard_script: Script,
}

impl RedisQueueStore {
    pub fn new(pool: Arc<RedisPool>, config: QueueStoreConfig) -> Self {
        Self {
            pool,
            config,
            insert_script: Script::new(INSERT_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
            get_items_script: Script::new(GET_ITEMS_SCRIPT),
            remove_queue_script: Script::new(REMOVE_QUEUE_SCRIPT),
            discard_script: Script::new(DISCARD_SCRIPT),
        }
    }

    pub fn pool(&self) -> &Arc<RedisPool> {
        &self.pool
    }
}

/// Time a pool operation and count its failure under `operation`.
async fn instrumented<T, F>(operation: &'static str, fut: F) -> Result<T, QueueStoreError>
where
    F: Future<Output = Result<T, PoolError>>,
{
    let start = Instant::now();
    let result = fut.await;
    CacheMetrics::observe(operation, start.elapsed());
    result.map_err(|e| {
        CacheMetrics::record_error(operation);
        QueueStoreError::from(e)
    })
}

/// `(member, score)` pairs from a flattened WITHSCORES reply.
fn pair_with_sequences(flat: Vec<Vec<u8>>) -> Result<Vec<(Vec<u8>, u64)>, QueueStoreError> {
    if flat.len() % 2 != 0 {
        return Err(QueueStoreError::Protocol(format!(
            "queue read returned {} items, expected member/score pairs",
            flat.len()
        )));
    }

    let mut entries = Vec::with_capacity(flat.len() / 2);
    let mut items = flat.into_iter();
    while let (Some(member), Some(score)) = (items.next(), items.next()) {
        let sequence = std::str::from_utf8(&score)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| {
                QueueStoreError::Protocol(format!(
                    "non-numeric score {:?}",
                    String::from_utf8_lossy(&score)
                ))
            })?;
        entries.push((member, sequence as u64));
    }
    Ok(entries)
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[tracing::instrument(skip(self, envelope), fields(queue = %key, guid = %envelope.server_guid))]
    async fn insert(&self, key: &QueueKey, envelope: &Envelope) -> Result<u64, QueueStoreError> {
        let bytes = envelope.encode()?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut invocation = self.insert_script.prepare_invoke();
        invocation
            .key(key.queue_key())
            .key(key.metadata_key())
            .key(key.index_key())
            .arg(bytes)
            .arg(envelope.server_guid.to_string())
            .arg(now)
            .arg(self.config.queue_ttl.as_secs().max(1))
            .arg(key.queue_name());

        let sequence: u64 = instrumented(
            "insert",
            self.pool
                .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await }),
        )
        .await?;

        CacheMetrics::record_inserted();
        tracing::trace!(sequence = sequence, "Envelope queued");
        Ok(sequence)
    }

    async fn remove(&self, key: &QueueKey, guids: &[Uuid]) -> Result<Vec<Envelope>, QueueStoreError> {
        if guids.is_empty() {
            return Ok(Vec::new());
        }

        let mut invocation = self.remove_script.prepare_invoke();
        invocation
            .key(key.queue_key())
            .key(key.metadata_key())
            .key(key.index_key())
            .arg(key.queue_name());
        for guid in guids {
            invocation.arg(guid.to_string());
        }

        let removed: Vec<Vec<u8>> = instrumented(
            "remove",
            self.pool
                .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await }),
        )
        .await?;

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
        let queue_key = key.queue_key();
        let count: u64 = instrumented(
            "has_messages",
            self.pool
                .execute(|mut conn| async move { conn.zcard(queue_key).await }),
        )
        .await?;
        Ok(count > 0)
    }

    #[tracing::instrument(skip(self), fields(queue = %key))]
    async fn page(
        &self,
        key: &QueueKey,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Page, QueueStoreError> {
        let lower_bound = match after {
            Some(sequence) => format!("({}", sequence),
            None => "-inf".to_string(),
        };

        let mut invocation = self.get_items_script.prepare_invoke();
        invocation
            .key(key.queue_key())
            .key(key.persist_lock_key())
            .arg(lower_bound)
            .arg(limit.max(1));

        let (locked, flat): (i64, Vec<Vec<u8>>) = instrumented(
            "page",
            self.pool
                .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await }),
        )
        .await?;

        let entries = pair_with_sequences(flat).inspect_err(|e| {
            CacheMetrics::record_error("page");
            tracing::error!(queue = %key, error = %e, "Unexpected queue read reply");
        })?;
        Ok(decode_page(key, entries, locked == 1))
    }

    async fn clear(&self, key: &QueueKey) -> Result<(), QueueStoreError> {
        let mut invocation = self.remove_queue_script.prepare_invoke();
        invocation
            .key(key.queue_key())
            .key(key.metadata_key())
            .key(key.index_key())
            .arg(key.queue_name());

        let _: i64 = instrumented(
            "clear",
            self.pool
                .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await }),
        )
        .await?;
        Ok(())
    }

    async fn discard(&self, key: &QueueKey, sequences: &[u64]) -> Result<usize, QueueStoreError> {
        let mut invocation = self.discard_script.prepare_invoke();
        invocation
            .key(key.queue_key())
            .key(key.metadata_key())
            .key(key.index_key())
            .arg(key.queue_name());
        for sequence in sequences {
            invocation.arg(*sequence);
        }

        let removed: u64 = instrumented(
            "discard",
            self.pool
                .execute(|mut conn| async move { invocation.invoke_async(&mut conn).await }),
        )
        .await?;
        Ok(removed as usize)
    }

    async fn next_slot_to_persist(&self) -> Result<u16, QueueStoreError> {
        let counter: u64 = instrumented(
            "next_slot",
            self.pool.execute(|mut conn| async move {
                conn.incr(PERSIST_SLOT_COUNTER_KEY, 1u64).await
            }),
        )
        .await?;
        Ok((counter % SLOT_COUNT as u64) as u16)
    }

    async fn queues_to_persist(
        &self,
        slot: u16,
        max_time_ms: i64,
        limit: usize,
    ) -> Result<Vec<QueueKey>, QueueStoreError> {
        let index_key = queue_index_key(slot);
        let names: Vec<String> = instrumented(
            "queues_to_persist",
            self.pool.execute(|mut conn| async move {
                conn.zrangebyscore_limit(index_key, 0i64, max_time_ms, 0isize, limit as isize)
                    .await
            }),
        )
        .await?;

        Ok(names
            .into_iter()
            .filter_map(|name| match name.parse::<QueueKey>() {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!(slot = slot, error = %e, "Ignoring unparseable dirty index entry");
                    None
                }
            })
            .collect())
    }

    async fn lock_queue_for_persistence(
        &self,
        key: &QueueKey,
        ttl: Duration,
    ) -> Result<bool, QueueStoreError> {
        let lock_key = key.persist_lock_key();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = instrumented(
            "lock",
            self.pool.execute(|mut conn| async move {
                redis::cmd("SET")
                    .arg(lock_key)
                    .arg(1)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
            }),
        )
        .await?;
        Ok(reply.is_some())
    }

    async fn unlock_queue_for_persistence(&self, key: &QueueKey) -> Result<(), QueueStoreError> {
        let lock_key = key.persist_lock_key();
        let _: i64 = instrumented(
            "unlock",
            self.pool
                .execute(|mut conn| async move { conn.del(lock_key).await }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_flattened_reply() {
        let flat = vec![b"a".to_vec(), b"1".to_vec(), b"b".to_vec(), b"2".to_vec()];
        let entries = pair_with_sequences(flat).unwrap();
        assert_eq!(entries, vec![(b"a".to_vec(), 1), (b"b".to_vec(), 2)]);
    }

    #[test]
    fn test_odd_reply_is_a_protocol_error() {
        let flat = vec![b"a".to_vec(), b"1".to_vec(), b"b".to_vec()];
        let err = pair_with_sequences(flat).unwrap_err();
        assert!(matches!(err, QueueStoreError::Protocol(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_non_numeric_score_is_a_protocol_error() {
        let flat = vec![b"a".to_vec(), b"one".to_vec()];
        assert!(matches!(
            pair_with_sequences(flat),
            Err(QueueStoreError::Protocol(_))
        ));
    }

    #[test]
    fn test_scripts_reference_expected_keys() {
        assert!(INSERT_SCRIPT.contains("HINCRBY"));
        assert!(REMOVE_SCRIPT.contains("ZREM"));
        assert!(GET_ITEMS_SCRIPT.contains("WITHSCORES"));
        assert!(REMOVE_QUEUE_SCRIPT.contains("DEL"));
        assert!(DISCARD_SCRIPT.contains("ZREMRANGEBYSCORE"));
    }
}
