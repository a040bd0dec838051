use std::sync::Arc;

use futures::Stream;

use crate::metrics::DeliveryMetrics;
use crate::queue::{Envelope, QueueKey, QueueStore, QueueStoreConfig, QueueStoreError};

use super::pruner::StalePruner;

/// Reads a device queue as a lazy stream of deliverable envelopes.
#[derive(Clone)]
pub struct MessageStream {
    store: Arc<dyn QueueStore>,
    config: QueueStoreConfig,
}

impl MessageStream {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueStoreConfig) -> Self {
        Self { store, config }
    }

    /// Envelopes of `key` in sequence order.
    ///
    /// Pages are fetched one at a time, the next only once the previous
    /// page has been consumed. Ephemeral envelopes older than the maximum
    /// delay are never yielded; they go to a background pruner instead.
    /// A store error is yielded once and ends the stream.
    pub fn get(
        &self,
        key: QueueKey,
    ) -> impl Stream<Item = Result<Envelope, QueueStoreError>> + Send + 'static {
        let store = self.store.clone();
        let config = self.config.clone();

        async_stream::stream! {
            let mut pruner: Option<StalePruner> = None;
            let mut cursor = None;

            loop {
                let page = match store.page(&key, cursor, config.page_size).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::warn!(queue = %key, error = %e, "Queue read failed");
                        yield Err(e);
                        break;
                    }
                };

                let Some(next_cursor) = page.next_cursor else {
                    break;
                };

                if page.persist_in_progress {
                    tracing::debug!(queue = %key, "Reading through an in-progress persist");
                }

                let now = chrono::Utc::now().timestamp_millis();
                for envelope in page.envelopes {
                    if envelope.is_stale_ephemeral(now, config.max_ephemeral_delay) {
                        DeliveryMetrics::record_stale_ephemeral();
                        pruner
                            .get_or_insert_with(|| {
                                StalePruner::spawn(store.clone(), key, config.deletion_batch_size)
                            })
                            .push(envelope.server_guid);
                    } else {
                        DeliveryMetrics::record_delivered();
                        yield Ok(envelope);
                    }
                }

                cursor = Some(next_cursor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueueStore;
    use futures::StreamExt;
    use std::time::Duration;
    use uuid::Uuid;

    fn config(page_size: usize) -> QueueStoreConfig {
        QueueStoreConfig {
            page_size,
            ..QueueStoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_stream_spans_pages_in_order() {
        let store = Arc::new(MemoryQueueStore::new());
        let key = QueueKey::new(Uuid::new_v4(), 1);

        let mut inserted = Vec::new();
        for i in 0..7 {
            let envelope = Envelope::builder(Uuid::new_v4()).content(vec![i]).build();
            store.insert(&key, &envelope).await.unwrap();
            inserted.push(envelope.server_guid);
        }

        let stream = MessageStream::new(store, config(3));
        let delivered: Vec<Uuid> = stream
            .get(key)
            .map(|item| item.unwrap().server_guid)
            .collect()
            .await;

        assert_eq!(delivered, inserted);
    }

    #[tokio::test]
    async fn test_empty_queue_yields_nothing() {
        let store = Arc::new(MemoryQueueStore::new());
        let stream = MessageStream::new(store, config(10));
        let items: Vec<_> = stream.get(QueueKey::new(Uuid::new_v4(), 1)).collect().await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_stale_ephemeral_is_withheld_and_removed() {
        let store = Arc::new(MemoryQueueStore::new());
        let key = QueueKey::new(Uuid::new_v4(), 1);
        let now = chrono::Utc::now().timestamp_millis();

        let stale = Envelope::builder(Uuid::new_v4())
            .ephemeral(true)
            .timestamp(now - 60_000)
            .build();
        let fresh = Envelope::builder(Uuid::new_v4()).ephemeral(true).build();
        store.insert(&key, &stale).await.unwrap();
        store.insert(&key, &fresh).await.unwrap();

        let stream = MessageStream::new(store.clone(), config(10));
        let delivered: Vec<Envelope> = stream.get(key).map(Result::unwrap).collect().await;
        assert_eq!(delivered, vec![fresh]);

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.len(&key) != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stale envelope should be removed");
    }
}
