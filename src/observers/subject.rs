/*!
Generic subject/observer plumbing.

A [`Subject`] owns a list of observers. Notification snapshots the list under
the subject's own mutex, releases it, and invokes each observer in order while
holding an async gate so notifications on one subject never interleave.
Observer failures are logged and swallowed — they must never propagate back
into the executor.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Failure reported by an observer; recorded, never rethrown.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A subscriber to events of type `E`.
#[async_trait]
pub trait Observer<E: Send + Sync>: Send + Sync {
    async fn on_event(&self, event: &E) -> Result<(), ObserverError>;
}

/// Handle returned by [`Subject::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out point for one event type.
pub struct Subject<E> {
    name: &'static str,
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn Observer<E>>)>>,
    next_id: AtomicU64,
    // Serializes notification per subject; observer order is stable even when
    // multiple workflows notify concurrently.
    notify_gate: tokio::sync::Mutex<()>,
}

impl<E: Send + Sync> Subject<E> {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            notify_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer<E>>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.observers
            .lock()
            .expect("observer list poisoned")
            .push((id, observer));
        id
    }

    /// Remove a subscription. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().expect("observer list poisoned");
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.lock().expect("observer list poisoned").len()
    }

    /// Deliver `event` to every observer, in subscription order.
    pub async fn notify(&self, event: &E) {
        let _gate = self.notify_gate.lock().await;
        let snapshot: Vec<Arc<dyn Observer<E>>> = {
            let observers = self.observers.lock().expect("observer list poisoned");
            observers.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for observer in snapshot {
            if let Err(error) = observer.on_event(event).await {
                warn!(subject = self.name, error = %error, "observer failed");
            }
        }
    }
}

/// Recording sink for tests and snapshots.
pub struct MemorySink<E> {
    entries: Mutex<Vec<E>>,
}

impl<E> Default for MemorySink<E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> MemorySink<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<E> {
        self.entries.lock().expect("sink poisoned").clone()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("sink poisoned").clear();
    }
}

#[async_trait]
impl<E: Clone + Send + Sync> Observer<E> for MemorySink<E> {
    async fn on_event(&self, event: &E) -> Result<(), ObserverError> {
        self.entries.lock().expect("sink poisoned").push(event.clone());
        Ok(())
    }
}
