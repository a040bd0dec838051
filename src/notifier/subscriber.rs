//! Keyspace notification sources.
//!
//! A subscriber owns the pub/sub side of the bus: it tracks which
//! channels are wanted on which slot and forwards matching keyspace
//! events into the bus's dispatch channel.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::redis::PoolError;

/// One keyspace notification: the channel it arrived on and the command
/// that triggered it ("zadd", "del", ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceEvent {
    pub channel: String,
    pub operation: String,
}

impl KeyspaceEvent {
    pub fn new(channel: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    Keyspace(KeyspaceEvent),
    /// Subscriptions may have been lost; every bound queue must resubscribe
    TopologyChanged,
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("No node owns slot {0}")]
    NoNodeForSlot(u16),

    #[error("Invalid cluster topology: {0}")]
    Topology(String),

    #[error("Pub/sub connection to {0} is down")]
    NodeUnavailable(String),

    #[error("Subscriber is not running")]
    Closed,
}

pub(crate) type AckResult = Result<(), SubscriptionError>;

enum AckState {
    Ready(AckResult),
    Pending(oneshot::Receiver<AckResult>),
}

/// Completion of a subscribe or unsubscribe request.
///
/// Requests are submitted synchronously and confirmed asynchronously;
/// dropping the ack does not cancel the request.
pub struct SubscriptionAck(AckState);

impl SubscriptionAck {
    pub fn ready(result: AckResult) -> Self {
        Self(AckState::Ready(result))
    }

    pub fn pending() -> (oneshot::Sender<AckResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(AckState::Pending(rx)))
    }

    pub async fn wait(self) -> AckResult {
        match self.0 {
            AckState::Ready(result) => result,
            AckState::Pending(rx) => rx.await.unwrap_or(Err(SubscriptionError::Closed)),
        }
    }
}

#[async_trait]
pub trait KeyspaceSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begin forwarding events to `events`.
    async fn start(
        &self,
        events: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Result<(), SubscriptionError>;

    /// Submit a subscription for `channels` on the node owning `slot`.
    fn subscribe(&self, slot: u16, channels: Vec<String>) -> SubscriptionAck;

    fn unsubscribe(&self, slot: u16, channels: Vec<String>) -> SubscriptionAck;

    /// Re-read slot ownership. Returns `true` when it changed and existing
    /// subscriptions were dropped.
    async fn refresh_topology(&self) -> Result<bool, SubscriptionError>;

    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_ack_resolves_from_sender() {
        let (tx, ack) = SubscriptionAck::pending();
        tx.send(Ok(())).unwrap();
        assert!(ack.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_closed() {
        let (tx, ack) = SubscriptionAck::pending();
        drop(tx);
        assert!(matches!(ack.wait().await, Err(SubscriptionError::Closed)));
    }

    #[tokio::test]
    async fn test_ready_ack_carries_error() {
        let ack = SubscriptionAck::ready(Err(SubscriptionError::NoNodeForSlot(42)));
        let err = ack.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "No node owns slot 42");
    }
}
