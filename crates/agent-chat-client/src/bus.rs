//! In-process topic bus.
//!
//! Publishing is synchronous and unbuffered: only subscribers registered at
//! the moment of `publish` see the event. The same registry backs the
//! per-connection listener table, so transport events and UI topics share
//! one set of delivery rules.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::trace;

/// Callback invoked with the published detail.
pub type BusHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Entry {
    id: u64,
    active: AtomicBool,
    handler: BusHandler,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, Vec<Arc<Entry>>>>,
}

impl BusInner {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, Vec<Arc<Entry>>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics();
        if let Some(entries) = topics.get_mut(topic) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// Cloneable handle to a shared topic bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify every current subscriber of `topic`, in registration order.
    ///
    /// Returns the number of handlers invoked. Publishing to a topic nobody
    /// listens on is a no-op.
    pub fn publish(&self, topic: &str, detail: &Value) -> usize {
        let snapshot: Vec<Arc<Entry>> = self
            .inner
            .topics()
            .get(topic)
            .map(|entries| entries.to_vec())
            .unwrap_or_default();

        let mut delivered = 0usize;
        for entry in snapshot {
            // Unsubscribed by an earlier handler in this same publish.
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            (entry.handler)(detail);
            delivered += 1;
        }
        trace!(topic, delivered, "bus publish");
        delivered
    }

    /// Register `handler` for `topic`.
    ///
    /// The returned subscription unsubscribes when dropped; keep it alive for
    /// as long as the handler should receive events.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> BusSubscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_handler(topic, Arc::new(handler))
    }

    /// Register an already shared handler for `topic`.
    pub fn subscribe_handler(
        &self,
        topic: impl Into<String>,
        handler: BusHandler,
    ) -> BusSubscription {
        let topic = topic.into();
        let entry = Arc::new(Entry {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            handler,
        });
        self.inner
            .topics()
            .entry(topic.clone())
            .or_default()
            .push(Arc::clone(&entry));

        BusSubscription {
            topic,
            entry,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics().get(topic).map_or(0, Vec::len)
    }
}

/// Registration of one handler on one topic.
pub struct BusSubscription {
    topic: String,
    entry: Arc<Entry>,
    bus: Weak<BusInner>,
}

impl BusSubscription {
    /// Topic this subscription listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }

    /// Remove the handler. Calling this more than once does nothing.
    pub fn unsubscribe(&self) {
        if !self.entry.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.topic, self.entry.id);
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}
