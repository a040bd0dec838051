//! Keyspace notification fan-out to connected device sessions.
//!
//! - `NotificationBus`: dispatch of keyspace events to bound listeners
//! - `ListenerRegistry`: queue <-> listener bindings
//! - `KeyspaceSubscriber`: pub/sub sources (Redis per-node, or local)

mod bus;
mod listener;
mod local_subscriber;
mod redis_subscriber;
mod registry;
mod subscriber;

pub use bus::{classify, NotificationBus};
pub use listener::{ListenerId, MessageAvailabilityListener, NotificationKind, SharedListener};
pub use local_subscriber::LocalKeyspaceSubscriber;
pub use redis_subscriber::RedisKeyspaceSubscriber;
pub use registry::{BindOutcome, ListenerRegistry, UnbindOutcome};
pub use subscriber::{
    KeyspaceEvent, KeyspaceSubscriber, SubscriberEvent, SubscriptionAck, SubscriptionError,
};
