//! Queue store tests against a live Redis server
//!
//! These exercise the Lua scripts end to end and are ignored by default.
//! Run them with a server reachable at `REDIS_URL`
//! (default `redis://127.0.0.1:6379`):
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;
use uuid::Uuid;

use ara_message_cache::config::RedisConfig;
use ara_message_cache::persister::{
    CoordinatorConfig, MemoryDurableStore, PersistOutcome, PersistenceCoordinator,
};
use ara_message_cache::queue::{Envelope, QueueKey, QueueStore, QueueStoreConfig, RedisQueueStore};
use ara_message_cache::redis::{CircuitBreaker, RedisHealth, RedisPool};

fn store() -> RedisQueueStore {
    let config = RedisConfig {
        url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        ..RedisConfig::default()
    };
    let pool = RedisPool::new(
        config,
        Arc::new(CircuitBreaker::new("redis")),
        Arc::new(RedisHealth::new()),
    )
    .unwrap();
    RedisQueueStore::new(Arc::new(pool), QueueStoreConfig::default())
}

fn queue() -> QueueKey {
    QueueKey::new(Uuid::new_v4(), 1)
}

fn envelope(content: &str) -> Envelope {
    Envelope::builder(Uuid::new_v4()).content(content).build()
}

async fn fill(store: &RedisQueueStore, key: &QueueKey, count: usize) -> Vec<Uuid> {
    let mut guids = Vec::with_capacity(count);
    for i in 0..count {
        let envelope = envelope(&format!("message-{i}"));
        guids.push(envelope.server_guid);
        store.insert(key, &envelope).await.unwrap();
    }
    guids
}

async fn walk(store: &RedisQueueStore, key: &QueueKey, page_size: usize) -> Vec<Uuid> {
    let mut cursor = None;
    let mut seen = Vec::new();
    loop {
        let page = store.page(key, cursor, page_size).await.unwrap();
        let Some(next) = page.next_cursor else {
            return seen;
        };
        seen.extend(page.envelopes.iter().map(|e| e.server_guid));
        cursor = Some(next);
    }
}

async fn is_dirty(store: &RedisQueueStore, key: &QueueKey) -> bool {
    store
        .queues_to_persist(key.slot(), i64::MAX, 10_000)
        .await
        .unwrap()
        .contains(key)
}

// ============================================================================
// Paging
// ============================================================================

mod redis_page_tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_pages_keep_insertion_order_for_any_page_size() {
        let store = store();
        let key = queue();
        let guids = fill(&store, &key, 7).await;

        for page_size in [1, 2, 3, 7, 50] {
            assert_eq!(walk(&store, &key, page_size).await, guids, "page size {page_size}");
        }

        assert_ok!(store.clear(&key).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_cursor_continues_after_last_sequence() {
        let store = store();
        let key = queue();
        let guids = fill(&store, &key, 3).await;

        let first = store.page(&key, None, 2).await.unwrap();
        let first_guids: Vec<Uuid> = first.envelopes.iter().map(|e| e.server_guid).collect();
        assert_eq!(first_guids, guids[..2]);
        assert_eq!(first.next_cursor, Some(2));

        let second = store.page(&key, first.next_cursor, 2).await.unwrap();
        let second_guids: Vec<Uuid> = second.envelopes.iter().map(|e| e.server_guid).collect();
        assert_eq!(second_guids, guids[2..]);

        assert!(store.page(&key, second.next_cursor, 2).await.unwrap().is_end());
        assert_ok!(store.clear(&key).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_page_reports_persist_lock() {
        let store = store();
        let key = queue();
        fill(&store, &key, 1).await;

        assert!(store
            .lock_queue_for_persistence(&key, Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .lock_queue_for_persistence(&key, Duration::from_secs(30))
            .await
            .unwrap());
        assert!(store.page(&key, None, 10).await.unwrap().persist_in_progress);

        assert_ok!(store.unlock_queue_for_persistence(&key).await);
        assert!(!store.page(&key, None, 10).await.unwrap().persist_in_progress);
        assert_ok!(store.clear(&key).await);
    }
}

// ============================================================================
// Insert, remove and clear
// ============================================================================

mod redis_mutation_tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_duplicate_guid_returns_existing_sequence() {
        let store = store();
        let key = queue();
        let message = envelope("a");

        let sequence = store.insert(&key, &message).await.unwrap();
        assert_eq!(store.insert(&key, &message).await.unwrap(), sequence);
        assert_eq!(walk(&store, &key, 10).await, vec![message.server_guid]);

        assert_ok!(store.clear(&key).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_remove_twice_reports_nothing_the_second_time() {
        let store = store();
        let key = queue();
        let guids = fill(&store, &key, 2).await;

        let removed = store.remove(&key, &guids[..1]).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].server_guid, guids[0]);
        assert!(store.remove(&key, &guids[..1]).await.unwrap().is_empty());
        assert_eq!(walk(&store, &key, 10).await, guids[1..]);

        assert_ok!(store.clear(&key).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_sequence_counter_survives_emptying() {
        let store = store();
        let key = queue();
        let guids = fill(&store, &key, 2).await;

        store.remove(&key, &guids).await.unwrap();
        assert!(!store.has_messages(&key).await.unwrap());
        assert_eq!(store.insert(&key, &envelope("c")).await.unwrap(), 3);

        // Clearing drops the counter with the metadata.
        assert_ok!(store.clear(&key).await);
        assert_eq!(store.insert(&key, &envelope("d")).await.unwrap(), 1);
        assert_ok!(store.clear(&key).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_dirty_index_follows_queue_contents() {
        let store = store();
        let key = queue();
        assert!(!store.has_messages(&key).await.unwrap());
        assert!(!is_dirty(&store, &key).await);

        let guids = fill(&store, &key, 2).await;
        assert!(store.has_messages(&key).await.unwrap());
        assert!(is_dirty(&store, &key).await);

        store.remove(&key, &guids[..1]).await.unwrap();
        assert!(is_dirty(&store, &key).await);
        store.remove(&key, &guids[1..]).await.unwrap();
        assert!(!store.has_messages(&key).await.unwrap());
        assert!(!is_dirty(&store, &key).await);

        fill(&store, &key, 1).await;
        assert_ok!(store.clear(&key).await);
        assert_ok!(store.clear(&key).await);
        assert!(!store.has_messages(&key).await.unwrap());
        assert!(!is_dirty(&store, &key).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_discard_drops_entries_and_dirty_entry() {
        let store = store();
        let key = queue();
        let guids = fill(&store, &key, 2).await;

        assert_eq!(store.discard(&key, &[1, 99]).await.unwrap(), 1);
        assert_eq!(walk(&store, &key, 10).await, guids[1..]);
        assert!(is_dirty(&store, &key).await);

        assert_eq!(store.discard(&key, &[2]).await.unwrap(), 1);
        assert!(!store.has_messages(&key).await.unwrap());
        assert!(!is_dirty(&store, &key).await);

        // The discarded guid no longer maps to a sequence.
        let again = Envelope::builder(guids[0]).content("again").build();
        assert_eq!(store.insert(&key, &again).await.unwrap(), 3);
        assert_ok!(store.clear(&key).await);
    }
}

// ============================================================================
// Handoff
// ============================================================================

mod redis_handoff_tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_coordinator_drains_queue() {
        let store = Arc::new(store());
        let durable = Arc::new(MemoryDurableStore::new());
        let key = queue();
        fill(&store, &key, 5).await;

        let coordinator = PersistenceCoordinator::new(
            store.clone(),
            durable.clone(),
            CoordinatorConfig {
                page_size: 2,
                idle_threshold: Duration::ZERO,
                ..CoordinatorConfig::default()
            },
        );
        assert_eq!(
            coordinator.persist_queue(&key).await.unwrap(),
            PersistOutcome::Persisted {
                count: 5,
                complete: true
            }
        );
        assert_eq!(durable.persisted(&key).len(), 5);
        assert!(!store.has_messages(&key).await.unwrap());
        assert!(!is_dirty(&store, &key).await);
        assert_ok!(store.clear(&key).await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_persist_lock_expires() {
        let store = store();
        let key = queue();

        assert!(store
            .lock_queue_for_persistence(&key, Duration::from_millis(100))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store
            .lock_queue_for_persistence(&key, Duration::from_millis(100))
            .await
            .unwrap());
    }
}
