//! Redis keyspace subscriber.
//!
//! Keyspace notifications are emitted only by the node that owns the key,
//! so each node gets its own pub/sub connection, driven by a dedicated
//! task. Channels are routed to a node by slot using the current
//! topology. A driver that loses its connection reconnects with
//! exponential backoff, restores its own channels and reports a topology
//! change so the bus resubscribes every bound queue.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::PubSub;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::redis::{
    BackoffConfig, ClusterTopology, ExponentialBackoff, NodeAddress, RedisHealth, RedisPool,
};

use super::subscriber::{
    AckResult, KeyspaceEvent, KeyspaceSubscriber, SubscriberEvent, SubscriptionAck,
    SubscriptionError,
};

/// Keyspace events (K) for generic (g) and sorted set (z) commands.
const NOTIFY_KEYSPACE_EVENTS: &str = "Kgz";

const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

enum DriverCommand {
    Subscribe(Vec<String>, oneshot::Sender<AckResult>),
    Unsubscribe(Vec<String>, oneshot::Sender<AckResult>),
}

enum Next {
    Command(Option<DriverCommand>),
    Message(Option<redis::Msg>),
}

enum DriveEnd {
    Shutdown,
    ConnectionLost,
}

/// Owns one node's pub/sub connection. Exits when its command sender
/// is dropped.
struct NodeDriver {
    node: NodeAddress,
    client: redis::Client,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    events: mpsc::UnboundedSender<SubscriberEvent>,
    channels: HashSet<String>,
    backoff: ExponentialBackoff,
    health: Arc<RedisHealth>,
}

impl NodeDriver {
    async fn run(mut self) {
        let mut reconnecting = false;

        loop {
            let Some(mut pubsub) = self.connect().await else {
                break;
            };

            self.health.subscriber_connected();
            self.backoff.reset();
            tracing::info!(
                node = %self.node,
                channels = self.channels.len(),
                "Keyspace subscription connected"
            );

            if reconnecting {
                let _ = self.events.send(SubscriberEvent::TopologyChanged);
            }
            reconnecting = true;

            let end = self.drive(&mut pubsub).await;
            self.health.subscriber_disconnected();

            match end {
                DriveEnd::Shutdown => break,
                DriveEnd::ConnectionLost => {
                    tracing::warn!(node = %self.node, "Keyspace subscription lost, reconnecting");
                }
            }
        }

        tracing::debug!(node = %self.node, "Keyspace subscription driver stopped");
    }

    /// Connect with backoff. Commands arriving while the node is down only
    /// update the wanted channel set. `None` once the driver is shut down.
    async fn connect(&mut self) -> Option<PubSub> {
        loop {
            let error = match self.try_connect().await {
                Ok(pubsub) => return Some(pubsub),
                Err(e) => e,
            };

            let delay = self.backoff.next_delay();
            tracing::warn!(
                node = %self.node,
                error = %error,
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Keyspace subscription connect failed"
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.record_offline(command),
                        None => return None,
                    },
                }
            }
        }
    }

    async fn try_connect(&self) -> redis::RedisResult<PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        if !self.channels.is_empty() {
            let channels: Vec<String> = self.channels.iter().cloned().collect();
            pubsub.subscribe(channels).await?;
        }
        Ok(pubsub)
    }

    fn record_offline(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Subscribe(channels, ack) => {
                self.channels.extend(channels);
                let _ = ack.send(Err(SubscriptionError::NodeUnavailable(
                    self.node.to_string(),
                )));
            }
            DriverCommand::Unsubscribe(channels, ack) => {
                for channel in &channels {
                    self.channels.remove(channel);
                }
                let _ = ack.send(Ok(()));
            }
        }
    }

    async fn drive(&mut self, pubsub: &mut PubSub) -> DriveEnd {
        loop {
            let next = {
                let mut messages = pubsub.on_message();
                tokio::select! {
                    command = self.commands.recv() => Next::Command(command),
                    message = messages.next() => Next::Message(message),
                }
            };

            match next {
                Next::Command(None) => return DriveEnd::Shutdown,
                Next::Command(Some(command)) => {
                    if !self.apply(pubsub, command).await {
                        return DriveEnd::ConnectionLost;
                    }
                }
                Next::Message(None) => return DriveEnd::ConnectionLost,
                Next::Message(Some(message)) => {
                    let operation: String = match message.get_payload() {
                        Ok(operation) => operation,
                        Err(e) => {
                            tracing::warn!(error = %e, "Unreadable keyspace notification");
                            continue;
                        }
                    };
                    let event = KeyspaceEvent::new(message.get_channel_name(), operation);
                    if self.events.send(SubscriberEvent::Keyspace(event)).is_err() {
                        return DriveEnd::Shutdown;
                    }
                }
            }
        }
    }

    /// Apply a command on the live connection. `false` when the connection
    /// failed; the channel set is kept so the reconnect restores it.
    async fn apply(&mut self, pubsub: &mut PubSub, command: DriverCommand) -> bool {
        match command {
            DriverCommand::Subscribe(channels, ack) => {
                self.channels.extend(channels.iter().cloned());
                let result = pubsub.subscribe(channels).await;
                let healthy = result.is_ok();
                let _ = ack.send(result.map_err(SubscriptionError::from));
                healthy
            }
            DriverCommand::Unsubscribe(channels, ack) => {
                for channel in &channels {
                    self.channels.remove(channel);
                }
                let result = pubsub.unsubscribe(channels).await;
                let healthy = result.is_ok();
                let _ = ack.send(result.map_err(SubscriptionError::from));
                healthy
            }
        }
    }
}

struct DriverHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct SubscriberState {
    topology: ClusterTopology,
    drivers: HashMap<NodeAddress, DriverHandle>,
    events: Option<mpsc::UnboundedSender<SubscriberEvent>>,
}

pub struct RedisKeyspaceSubscriber {
    pool: Arc<RedisPool>,
    backoff: BackoffConfig,
    state: Mutex<SubscriberState>,
}

impl RedisKeyspaceSubscriber {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        let backoff = BackoffConfig::from(pool.config());
        Self {
            pool,
            backoff,
            state: Mutex::new(SubscriberState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SubscriberState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_driver(
        &self,
        node: NodeAddress,
        events: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Result<DriverHandle, SubscriptionError> {
        let client = self.pool.node_client(&node)?;
        let (commands, receiver) = mpsc::unbounded_channel();

        let driver = NodeDriver {
            node,
            client,
            commands: receiver,
            events,
            channels: HashSet::new(),
            backoff: ExponentialBackoff::with_config(self.backoff.clone()),
            health: self.pool.health().clone(),
        };

        Ok(DriverHandle {
            commands,
            task: tokio::spawn(driver.run()),
        })
    }

    async fn configure_keyspace_notifications(&self, topology: &ClusterTopology) {
        for node in topology.nodes() {
            let result = async {
                let client = self.pool.node_client(node)?;
                let mut conn = client.get_multiplexed_async_connection().await?;
                let _: () = redis::cmd("CONFIG")
                    .arg("SET")
                    .arg("notify-keyspace-events")
                    .arg(NOTIFY_KEYSPACE_EVENTS)
                    .query_async(&mut conn)
                    .await?;
                Ok::<_, SubscriptionError>(())
            }
            .await;

            match result {
                Ok(()) => tracing::debug!(node = %node, "Keyspace notifications enabled"),
                Err(e) => tracing::warn!(
                    node = %node,
                    error = %e,
                    "Failed to enable keyspace notifications"
                ),
            }
        }
    }

    /// Swap in `topology`, dropping every driver when it differs.
    fn install_topology(&self, topology: ClusterTopology) -> bool {
        let mut state = self.state();
        if state.topology == topology {
            return false;
        }

        let dropped = state.drivers.len();
        state.topology = topology;
        // Dropping a handle closes its command channel; the driver exits.
        state.drivers.clear();

        tracing::info!(
            nodes = state.topology.nodes().len(),
            dropped_connections = dropped,
            "Keyspace subscription topology updated"
        );
        true
    }
}

#[async_trait]
impl KeyspaceSubscriber for RedisKeyspaceSubscriber {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn start(
        &self,
        events: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Result<(), SubscriptionError> {
        let topology = self.pool.topology().await?;
        if topology.is_empty() {
            return Err(SubscriptionError::Topology("no slots assigned".to_string()));
        }

        if self.pool.config().configure_keyspace_notifications {
            self.configure_keyspace_notifications(&topology).await;
        }

        self.state().events = Some(events);
        self.install_topology(topology);

        tracing::info!(cluster = self.pool.is_cluster(), "Redis keyspace subscriber started");
        Ok(())
    }

    fn subscribe(&self, slot: u16, channels: Vec<String>) -> SubscriptionAck {
        let mut state = self.state();

        let Some(events) = state.events.clone() else {
            return SubscriptionAck::ready(Err(SubscriptionError::Closed));
        };
        let Some(node) = state.topology.node_for_slot(slot).cloned() else {
            return SubscriptionAck::ready(Err(SubscriptionError::NoNodeForSlot(slot)));
        };

        let driver = match state.drivers.entry(node.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.spawn_driver(node, events) {
                Ok(handle) => entry.insert(handle),
                Err(e) => return SubscriptionAck::ready(Err(e)),
            },
        };

        let (tx, ack) = SubscriptionAck::pending();
        // A closed driver drops `tx`, which resolves the ack as closed.
        let _ = driver.commands.send(DriverCommand::Subscribe(channels, tx));
        ack
    }

    fn unsubscribe(&self, slot: u16, channels: Vec<String>) -> SubscriptionAck {
        let state = self.state();

        let driver = state
            .topology
            .node_for_slot(slot)
            .and_then(|node| state.drivers.get(node));
        let Some(driver) = driver else {
            return SubscriptionAck::ready(Ok(()));
        };

        let (tx, ack) = SubscriptionAck::pending();
        let _ = driver.commands.send(DriverCommand::Unsubscribe(channels, tx));
        ack
    }

    async fn refresh_topology(&self) -> Result<bool, SubscriptionError> {
        let topology = self.pool.topology().await?;
        if topology.is_empty() {
            return Err(SubscriptionError::Topology("no slots assigned".to_string()));
        }

        let changed = self.install_topology(topology);
        if changed && self.pool.config().configure_keyspace_notifications {
            let topology = self.state().topology.clone();
            self.configure_keyspace_notifications(&topology).await;
        }
        Ok(changed)
    }

    async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.state();
            state.events = None;
            state.drivers.drain().map(|(_, handle)| handle.task).collect()
        };

        let count = tasks.len();
        if tokio::time::timeout(DRIVER_STOP_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Timed out waiting for keyspace subscription drivers");
        }

        tracing::info!(connections = count, "Redis keyspace subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::redis::{CircuitBreaker, SlotRange};

    fn subscriber() -> RedisKeyspaceSubscriber {
        let pool = RedisPool::new(
            RedisConfig::default(),
            Arc::new(CircuitBreaker::new("redis")),
            Arc::new(RedisHealth::new()),
        )
        .unwrap();
        RedisKeyspaceSubscriber::new(Arc::new(pool))
    }

    fn two_node_topology() -> ClusterTopology {
        ClusterTopology::from_ranges(vec![
            SlotRange {
                start: 0,
                end: 8191,
                node: NodeAddress::new("10.0.0.1", 6379),
            },
            SlotRange {
                start: 8192,
                end: 16383,
                node: NodeAddress::new("10.0.0.2", 6379),
            },
        ])
    }

    #[tokio::test]
    async fn test_subscribe_before_start_is_closed() {
        let subscriber = subscriber();
        let ack = subscriber.subscribe(1, vec!["channel".into()]);
        assert!(matches!(ack.wait().await, Err(SubscriptionError::Closed)));
    }

    #[tokio::test]
    async fn test_unsubscribe_without_driver_is_a_no_op() {
        let subscriber = subscriber();
        subscriber.install_topology(two_node_topology());
        assert!(subscriber.unsubscribe(1, vec!["channel".into()]).wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_slot_without_owner_is_rejected() {
        let subscriber = subscriber();
        let (tx, _rx) = mpsc::unbounded_channel();
        subscriber.state().events = Some(tx);
        subscriber.install_topology(ClusterTopology::from_ranges(vec![SlotRange {
            start: 0,
            end: 100,
            node: NodeAddress::new("10.0.0.1", 6379),
        }]));

        let ack = subscriber.subscribe(200, vec!["channel".into()]);
        assert!(matches!(
            ack.wait().await,
            Err(SubscriptionError::NoNodeForSlot(200))
        ));
    }

    #[tokio::test]
    async fn test_installing_same_topology_keeps_drivers() {
        let subscriber = subscriber();
        assert!(subscriber.install_topology(two_node_topology()));
        assert!(!subscriber.install_topology(two_node_topology()));
        assert!(subscriber.install_topology(ClusterTopology::single(NodeAddress::new(
            "10.0.0.3", 6379
        ))));
    }
}
