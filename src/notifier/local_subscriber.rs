//! Keyspace subscriber fed by the in-memory queue store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashSet;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::subscriber::{
    KeyspaceEvent, KeyspaceSubscriber, SubscriberEvent, SubscriptionAck, SubscriptionError,
};

#[derive(Default)]
struct Running {
    events: Option<mpsc::UnboundedSender<SubscriberEvent>>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct LocalKeyspaceSubscriber {
    source: broadcast::Sender<KeyspaceEvent>,
    channels: Arc<DashSet<String>>,
    running: Mutex<Running>,
}

impl LocalKeyspaceSubscriber {
    pub fn new(source: broadcast::Sender<KeyspaceEvent>) -> Self {
        Self {
            source,
            channels: Arc::new(DashSet::new()),
            running: Mutex::new(Running::default()),
        }
    }

    fn running(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop every subscription and report a topology change, as a node
    /// failover would.
    pub fn simulate_failover(&self) {
        self.channels.clear();
        if let Some(events) = &self.running().events {
            let _ = events.send(SubscriberEvent::TopologyChanged);
        }
    }
}

#[async_trait]
impl KeyspaceSubscriber for LocalKeyspaceSubscriber {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn start(
        &self,
        events: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Result<(), SubscriptionError> {
        let mut stream = BroadcastStream::new(self.source.subscribe());
        let channels = self.channels.clone();
        let forward_to = events.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        if !channels.contains(&event.channel) {
                            continue;
                        }
                        if forward_to.send(SubscriberEvent::Keyspace(event)).is_err() {
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        tracing::warn!(missed = missed, "Local keyspace subscriber lagged");
                    }
                }
            }
        });

        let mut running = self.running();
        if let Some(previous) = running.forwarder.replace(forwarder) {
            previous.abort();
        }
        running.events = Some(events);

        tracing::info!("Local keyspace subscriber started");
        Ok(())
    }

    fn subscribe(&self, _slot: u16, channels: Vec<String>) -> SubscriptionAck {
        for channel in channels {
            self.channels.insert(channel);
        }
        SubscriptionAck::ready(Ok(()))
    }

    fn unsubscribe(&self, _slot: u16, channels: Vec<String>) -> SubscriptionAck {
        for channel in &channels {
            self.channels.remove(channel);
        }
        SubscriptionAck::ready(Ok(()))
    }

    async fn refresh_topology(&self) -> Result<bool, SubscriptionError> {
        Ok(false)
    }

    async fn stop(&self) {
        let mut running = self.running();
        if let Some(forwarder) = running.forwarder.take() {
            forwarder.abort();
        }
        running.events = None;
        self.channels.clear();
        tracing::info!("Local keyspace subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_only_subscribed_channels() {
        let (source, _) = broadcast::channel(16);
        let subscriber = LocalKeyspaceSubscriber::new(source.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.start(tx).await.unwrap();

        subscriber
            .subscribe(0, vec!["wanted".to_string()])
            .wait()
            .await
            .unwrap();

        source.send(KeyspaceEvent::new("ignored", "zadd")).unwrap();
        source.send(KeyspaceEvent::new("wanted", "zadd")).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(SubscriberEvent::Keyspace(KeyspaceEvent::new("wanted", "zadd")))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_and_failover_drop_channels() {
        let (source, _) = broadcast::channel(16);
        let subscriber = LocalKeyspaceSubscriber::new(source);
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.start(tx).await.unwrap();

        subscriber.subscribe(0, vec!["a".into(), "b".into()]);
        subscriber.unsubscribe(0, vec!["a".into()]);
        assert!(!subscriber.is_subscribed("a"));
        assert!(subscriber.is_subscribed("b"));

        subscriber.simulate_failover();
        assert_eq!(subscriber.channel_count(), 0);
        assert_eq!(rx.recv().await, Some(SubscriberEvent::TopologyChanged));
    }
}
