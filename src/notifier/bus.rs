//! Routes keyspace notifications to the listener bound to each queue.
//!
//! Subscribers push raw events into an unbounded channel; a single
//! dispatch loop classifies them and runs listener callbacks on spawned
//! tasks, bounded by a semaphore, so a slow listener never stalls a
//! pub/sub reader.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::config::NotifierConfig;
use crate::metrics::NotifierMetrics;
use crate::queue::key::{PERSIST_LOCK_KEY_PREFIX, QUEUE_KEY_PREFIX};
use crate::queue::{QueueKey, KEYSPACE_PREFIX};

use super::listener::{ListenerId, NotificationKind, SharedListener};
use super::registry::{ListenerRegistry, UnbindOutcome};
use super::subscriber::{KeyspaceEvent, KeyspaceSubscriber, SubscriberEvent, SubscriptionError};

pub struct NotificationBus {
    registry: ListenerRegistry,
    subscriber: Arc<dyn KeyspaceSubscriber>,
    config: NotifierConfig,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Map a keyspace event to the queue and notification it stands for.
/// Only "zadd" on a queue key and "del" on a persist lock key matter.
pub fn classify(event: &KeyspaceEvent) -> Option<(QueueKey, NotificationKind)> {
    let key = event.channel.strip_prefix(KEYSPACE_PREFIX)?;

    let kind = if key.starts_with(QUEUE_KEY_PREFIX) && event.operation == "zadd" {
        NotificationKind::NewMessages
    } else if key.starts_with(PERSIST_LOCK_KEY_PREFIX) && event.operation == "del" {
        NotificationKind::Persisted
    } else {
        return None;
    };

    match QueueKey::from_tagged(key) {
        Ok(queue) => Some((queue, kind)),
        Err(e) => {
            tracing::warn!(channel = %event.channel, error = %e, "Keyspace event for unparseable queue");
            None
        }
    }
}

impl NotificationBus {
    pub fn new(subscriber: Arc<dyn KeyspaceSubscriber>, config: NotifierConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: ListenerRegistry::new(),
            subscriber,
            config,
            dispatcher: Mutex::new(None),
        })
    }

    /// Start the subscriber and the dispatch loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), SubscriptionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber.start(tx).await?;

        let permits = Arc::new(Semaphore::new(self.config.dispatch_concurrency.max(1)));
        let handle = tokio::spawn(Self::dispatch_loop(Arc::downgrade(self), rx, permits));

        if let Some(previous) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle)
        {
            previous.abort();
        }

        tracing::info!(
            subscriber = self.subscriber.name(),
            concurrency = self.config.dispatch_concurrency,
            "Notification bus started"
        );
        Ok(())
    }

    async fn dispatch_loop(
        bus: Weak<Self>,
        mut events: mpsc::UnboundedReceiver<SubscriberEvent>,
        permits: Arc<Semaphore>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(bus) = bus.upgrade() else {
                break;
            };

            match event {
                SubscriberEvent::Keyspace(event) => {
                    NotifierMetrics::record_keyspace_event();
                    let Some((key, kind)) = classify(&event) else {
                        continue;
                    };
                    NotifierMetrics::record_notification(kind);

                    let Ok(permit) = permits.clone().acquire_owned().await else {
                        break;
                    };
                    tokio::spawn(async move {
                        bus.notify(key, kind).await;
                        drop(permit);
                    });
                }
                SubscriberEvent::TopologyChanged => {
                    NotifierMetrics::record_topology_change();
                    tokio::spawn(async move {
                        bus.resubscribe_all().await;
                    });
                }
            }
        }

        tracing::debug!("Notification dispatch loop stopped");
    }

    async fn notify(&self, key: QueueKey, kind: NotificationKind) {
        let listener = self.registry.resolve(&key, || {
            // Drop the subscription under the registry lock so a concurrent
            // attach cannot be overtaken by this unsubscribe.
            drop(self.subscriber.unsubscribe(key.slot(), key.channels()));
            NotifierMetrics::record_stale_subscription_pruned();
            tracing::debug!(queue = %key, "Pruned stale keyspace subscription");
        });

        let Some(listener) = listener else {
            return;
        };

        if !kind.deliver(listener.as_ref()).await {
            tracing::debug!(queue = %key, kind = %kind, "Listener declined further notifications");
            NotifierMetrics::record_auto_detached();
            self.detach(&listener).await;
        }
    }

    /// Bind `listener` to `key` and wait for the keyspace subscription.
    ///
    /// The binding replaces any previous listener for the queue. If the
    /// subscription cannot be confirmed the binding is kept, and the next
    /// resubscription retries it.
    pub async fn attach(
        &self,
        key: QueueKey,
        listener: SharedListener,
    ) -> Result<(), SubscriptionError> {
        let (outcome, ack) = self.registry.bind(key, listener, |outcome| {
            if let Some(previous) = outcome.moved_from {
                drop(
                    self.subscriber
                        .unsubscribe(previous.slot(), previous.channels()),
                );
            }
            self.subscriber.subscribe(key.slot(), key.channels())
        });

        if outcome.displaced.is_some() {
            tracing::debug!(queue = %key, "Replaced existing listener");
        }
        NotifierMetrics::set_listeners_attached(self.registry.len());

        ack.wait().await.inspect_err(|e| {
            tracing::warn!(queue = %key, error = %e, "Keyspace subscription not confirmed");
        })
    }

    /// Remove `listener`'s binding, unsubscribing only when the queue
    /// still belonged to it.
    pub async fn detach(&self, listener: &SharedListener) {
        let (outcome, ack) = self
            .registry
            .unbind(ListenerId::of(listener), |key| {
                self.subscriber.unsubscribe(key.slot(), key.channels())
            });

        match outcome {
            UnbindOutcome::NotBound => {}
            UnbindOutcome::Replaced(key) => {
                NotifierMetrics::record_removed_after_add();
                tracing::debug!(queue = %key, "Detach of a listener that was already replaced");
            }
            UnbindOutcome::Removed(key) => {
                if let Some(ack) = ack {
                    if let Err(e) = ack.wait().await {
                        tracing::warn!(queue = %key, error = %e, "Keyspace unsubscribe failed");
                    }
                }
            }
        }

        NotifierMetrics::set_listeners_attached(self.registry.len());
    }

    /// Re-issue subscriptions for every bound queue, one at a time.
    pub async fn resubscribe_all(&self) -> usize {
        let queues = self.registry.queues();
        let mut restored = 0;

        for key in &queues {
            match self
                .subscriber
                .subscribe(key.slot(), key.channels())
                .wait()
                .await
            {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::warn!(queue = %key, error = %e, "Resubscription failed");
                }
            }
        }

        NotifierMetrics::record_resubscribed(restored);
        tracing::info!(
            queues = queues.len(),
            restored = restored,
            "Resubscribed keyspace notifications"
        );
        restored
    }

    /// Re-read cluster topology, resubscribing everything when it moved.
    pub async fn refresh_topology(&self) -> Result<bool, SubscriptionError> {
        let changed = self.subscriber.refresh_topology().await?;
        if changed {
            NotifierMetrics::record_topology_change();
            self.resubscribe_all().await;
        }
        Ok(changed)
    }

    pub fn is_attached(&self, key: &QueueKey) -> bool {
        self.registry.contains(key)
    }

    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscriber_name(&self) -> &'static str {
        self.subscriber.name()
    }

    /// Stop the subscriber and the dispatch loop. Bindings are kept.
    pub async fn stop(&self) {
        self.subscriber.stop().await;

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        tracing::info!("Notification bus stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn key() -> QueueKey {
        QueueKey::new(Uuid::new_v4(), 3)
    }

    #[test]
    fn test_classify_new_messages() {
        let key = key();
        let event = KeyspaceEvent::new(key.queue_channel(), "zadd");
        assert_eq!(classify(&event), Some((key, NotificationKind::NewMessages)));
    }

    #[test]
    fn test_classify_persisted() {
        let key = key();
        let event = KeyspaceEvent::new(key.persist_lock_channel(), "del");
        assert_eq!(classify(&event), Some((key, NotificationKind::Persisted)));
    }

    #[test]
    fn test_classify_ignores_other_operations() {
        let key = key();
        assert!(classify(&KeyspaceEvent::new(key.queue_channel(), "zremrangebyscore")).is_none());
        assert!(classify(&KeyspaceEvent::new(key.queue_channel(), "del")).is_none());
        assert!(classify(&KeyspaceEvent::new(key.persist_lock_channel(), "set")).is_none());
        assert!(classify(&KeyspaceEvent::new("user_queue::{x}", "zadd")).is_none());
    }

    #[test]
    fn test_classify_rejects_malformed_queue_name() {
        let event = KeyspaceEvent::new("__keyspace@0__:user_queue::{not-a-queue}", "zadd");
        assert!(classify(&event).is_none());
    }
}
