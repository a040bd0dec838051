use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Wake-up hooks for a connected device session.
///
/// Both callbacks run on dispatcher tasks, never on a pub/sub reader.
/// Returning `false` asks the bus to detach the listener.
#[async_trait]
pub trait MessageAvailabilityListener: Send + Sync {
    /// New envelopes were appended to the listener's queue.
    async fn handle_new_messages_available(&self) -> bool;

    /// The queue was handed off to durable storage; the session should
    /// re-read from there.
    async fn handle_messages_persisted(&self) -> bool;
}

pub type SharedListener = Arc<dyn MessageAvailabilityListener>;

/// Identity of a listener instance, independent of its vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

impl ListenerId {
    pub fn of(listener: &SharedListener) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }
}

/// Which keyspace change woke the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    NewMessages,
    Persisted,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewMessages => "new_messages",
            NotificationKind::Persisted => "persisted",
        }
    }

    pub(crate) async fn deliver(&self, listener: &dyn MessageAvailabilityListener) -> bool {
        match self {
            NotificationKind::NewMessages => listener.handle_new_messages_available().await,
            NotificationKind::Persisted => listener.handle_messages_persisted().await,
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
