//! # Predicate pub/sub bus.
//!
//! [`EventBus`] fans every published value out to the subscribers whose
//! predicate accepts it. Each subscriber owns a bounded mailbox; delivery to
//! a full mailbox waits up to the bus's send timeout and then drops the value
//! for that subscriber only. Deliveries to different subscribers run
//! concurrently, so one slow subscriber delays a publish by at most one
//! timeout.
//!
//! ```text
//! publish(v) ──► predicate? ──► mailbox(sub 1)
//!            ├─► predicate? ──► mailbox(sub 2)
//!            └─► predicate? ──► mailbox(sub N)
//! ```
//!
//! Dropping a [`Subscription`] evicts it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    tx: mpsc::Sender<T>,
    predicate: Option<Predicate<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

struct Inner<T> {
    subscribers: RwLock<HashMap<u64, Subscriber<T>>>,
    next_id: AtomicU64,
    buffer: usize,
    timeout: Duration,
}

impl<T> Inner<T> {
    fn evict(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Broadcast bus with predicate subscriptions.
pub struct EventBus<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> EventBus<T> {
    /// Create a bus with the given mailbox size and per-subscriber timeout.
    pub fn new(buffer: usize, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                buffer: buffer.max(1),
                timeout,
            }),
        }
    }

    /// Subscribe to every published value.
    pub fn subscribe(&self) -> Subscription<T> {
        self.register(None)
    }

    /// Subscribe to values accepted by `predicate`.
    pub fn subscribe_filtered<F>(&self, predicate: F) -> Subscription<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.register(Some(Arc::new(predicate)))
    }

    fn register(&self, predicate: Option<Predicate<T>>) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscriber { tx, predicate });

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `value` to every interested subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub async fn publish(&self, value: T) -> usize {
        let subscribers: Vec<(u64, Subscriber<T>)> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let timeout = self.inner.timeout;
        let deliveries = subscribers.into_iter().map(|(id, sub)| {
            let value = value.clone();
            async move {
                if let Some(predicate) = &sub.predicate {
                    if !predicate(&value) {
                        return (id, Delivery::Skipped);
                    }
                }
                match sub.tx.send_timeout(value, timeout).await {
                    Ok(()) => (id, Delivery::Sent),
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => (id, Delivery::TimedOut),
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => (id, Delivery::Closed),
                }
            }
        });

        let mut sent = 0;
        for (id, delivery) in join_all(deliveries).await {
            match delivery {
                Delivery::Sent => sent += 1,
                Delivery::Skipped => {}
                Delivery::TimedOut => {
                    warn!(subscriber = id, "Event bus subscriber too slow, value dropped");
                }
                Delivery::Closed => {
                    debug!(subscriber = id, "Evicting closed event bus subscriber");
                    self.inner.evict(id);
                }
            }
        }
        sent
    }

    /// Wait for the next value accepted by `predicate`.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let mut subscription = self.subscribe_filtered(predicate);
        tokio::time::timeout(timeout, subscription.recv())
            .await
            .ok()
            .flatten()
    }
}

enum Delivery {
    Sent,
    Skipped,
    TimedOut,
    Closed,
}

/// A live subscription. Dropping it evicts the subscriber.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    bus: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    /// Receive the next value, or `None` if the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.evict(self.id);
        }
    }
}
