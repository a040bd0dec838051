//! Bidirectional queue <-> listener bindings.
//!
//! Both directions live behind one mutex. Callers that need to issue a
//! subscription change in step with a binding change pass a closure that
//! runs while the lock is held, so subscribe and unsubscribe requests for
//! one queue are submitted in the same order as the binding changes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::queue::QueueKey;

use super::listener::{ListenerId, SharedListener};

#[derive(Default)]
struct Bindings {
    by_queue: HashMap<QueueKey, SharedListener>,
    by_listener: HashMap<ListenerId, QueueKey>,
}

/// Result of binding a listener to a queue.
#[derive(Default)]
pub struct BindOutcome {
    /// Listener previously bound to the same queue
    pub displaced: Option<SharedListener>,
    /// Queue the listener was bound to before, if it moved
    pub moved_from: Option<QueueKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindOutcome {
    /// The listener had no binding
    NotBound,
    /// A newer listener took over the queue; only the reverse entry was dropped
    Replaced(QueueKey),
    /// The binding was removed
    Removed(QueueKey),
}

#[derive(Default)]
pub struct ListenerRegistry {
    bindings: Mutex<Bindings>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, Bindings> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `listener` to `key`, last write wins. `under_lock` runs before
    /// the lock is released.
    pub fn bind<T>(
        &self,
        key: QueueKey,
        listener: SharedListener,
        under_lock: impl FnOnce(&BindOutcome) -> T,
    ) -> (BindOutcome, T) {
        let mut bindings = self.bindings();
        let id = ListenerId::of(&listener);

        let mut outcome = BindOutcome::default();

        if let Some(previous) = bindings.by_listener.insert(id, key) {
            let still_owner = bindings
                .by_queue
                .get(&previous)
                .is_some_and(|current| ListenerId::of(current) == id);
            if previous != key && still_owner {
                bindings.by_queue.remove(&previous);
                outcome.moved_from = Some(previous);
            }
        }

        // The displaced listener keeps its reverse entry until it detaches,
        // which then reports `Replaced`.
        if let Some(displaced) = bindings.by_queue.insert(key, listener) {
            if ListenerId::of(&displaced) != id {
                outcome.displaced = Some(displaced);
            }
        }

        let result = under_lock(&outcome);
        (outcome, result)
    }

    /// Drop `listener`'s binding. `on_removed` runs under the lock only when
    /// the queue still pointed at this listener.
    pub fn unbind<T>(
        &self,
        listener: ListenerId,
        on_removed: impl FnOnce(&QueueKey) -> T,
    ) -> (UnbindOutcome, Option<T>) {
        let mut bindings = self.bindings();

        let Some(key) = bindings.by_listener.remove(&listener) else {
            return (UnbindOutcome::NotBound, None);
        };

        let still_bound = bindings
            .by_queue
            .get(&key)
            .map(|current| ListenerId::of(current) == listener)
            .unwrap_or(false);

        if !still_bound {
            return (UnbindOutcome::Replaced(key), None);
        }

        bindings.by_queue.remove(&key);
        let result = on_removed(&key);
        (UnbindOutcome::Removed(key), Some(result))
    }

    /// Listener bound to `key`. On a miss `on_unbound` runs under the lock.
    pub fn resolve(&self, key: &QueueKey, on_unbound: impl FnOnce()) -> Option<SharedListener> {
        let bindings = self.bindings();
        match bindings.by_queue.get(key) {
            Some(listener) => Some(listener.clone()),
            None => {
                on_unbound();
                None
            }
        }
    }

    pub fn contains(&self, key: &QueueKey) -> bool {
        self.bindings().by_queue.contains_key(key)
    }

    /// Snapshot of every bound queue.
    pub fn queues(&self) -> Vec<QueueKey> {
        self.bindings().by_queue.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings().by_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MessageAvailabilityListener;
    use async_trait::async_trait;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Session;

    #[async_trait]
    impl MessageAvailabilityListener for Session {
        async fn handle_new_messages_available(&self) -> bool {
            true
        }

        async fn handle_messages_persisted(&self) -> bool {
            true
        }
    }

    fn listener() -> SharedListener {
        Arc::new(Session)
    }

    fn key() -> QueueKey {
        QueueKey::new(Uuid::new_v4(), 1)
    }

    #[test]
    fn test_bind_then_unbind() {
        let registry = ListenerRegistry::new();
        let key = key();
        let session = listener();

        let (outcome, ran) = registry.bind(key, session.clone(), |_| true);
        assert!(ran);
        assert!(outcome.displaced.is_none());
        assert!(registry.contains(&key));

        let (outcome, removed) = registry.unbind(ListenerId::of(&session), |k| *k);
        assert_eq!(outcome, UnbindOutcome::Removed(key));
        assert_eq!(removed, Some(key));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_newer_listener_wins_and_stale_unbind_is_benign() {
        let registry = ListenerRegistry::new();
        let key = key();
        let old = listener();
        let new = listener();

        registry.bind(key, old.clone(), |_| ());
        let (outcome, _) = registry.bind(key, new.clone(), |_| ());
        assert!(outcome
            .displaced
            .as_ref()
            .is_some_and(|d| ListenerId::of(d) == ListenerId::of(&old)));

        let (outcome, removed) = registry.unbind(ListenerId::of(&old), |_| ());
        assert_eq!(outcome, UnbindOutcome::Replaced(key));
        assert!(removed.is_none());

        let (outcome, _) = registry.unbind(ListenerId::of(&old), |_| ());
        assert_eq!(outcome, UnbindOutcome::NotBound);

        let resolved = registry.resolve(&key, || panic!("queue should be bound"));
        assert_eq!(
            resolved.map(|l| ListenerId::of(&l)),
            Some(ListenerId::of(&new))
        );
    }

    #[test]
    fn test_rebinding_moves_listener_between_queues() {
        let registry = ListenerRegistry::new();
        let first = key();
        let second = key();
        let session = listener();

        registry.bind(first, session.clone(), |_| ());
        let (outcome, _) = registry.bind(second, session.clone(), |_| ());

        assert_eq!(outcome.moved_from, Some(first));
        assert!(!registry.contains(&first));
        assert!(registry.contains(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_displaced_listener_moving_on_leaves_new_binding_intact() {
        let registry = ListenerRegistry::new();
        let shared = key();
        let elsewhere = key();
        let old = listener();
        let new = listener();

        registry.bind(shared, old.clone(), |_| ());
        registry.bind(shared, new.clone(), |_| ());
        let (outcome, _) = registry.bind(elsewhere, old, |_| ());

        assert!(outcome.moved_from.is_none());
        assert!(registry.contains(&shared));
        assert!(registry.contains(&elsewhere));
    }

    #[test]
    fn test_rebinding_same_queue_is_not_a_displacement() {
        let registry = ListenerRegistry::new();
        let key = key();
        let session = listener();

        registry.bind(key, session.clone(), |_| ());
        let (outcome, _) = registry.bind(key, session, |_| ());
        assert!(outcome.displaced.is_none());
        assert!(outcome.moved_from.is_none());
    }

    #[test]
    fn test_resolve_miss_runs_fallback() {
        let registry = ListenerRegistry::new();
        let mut pruned = false;
        assert!(registry.resolve(&key(), || pruned = true).is_none());
        assert!(pruned);
    }
}
