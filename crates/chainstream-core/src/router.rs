//! Topic-addressed fan-out between the ingestion engine and its subscribers.
//!
//! Every subscription owns a bounded queue. Publishing never waits on a
//! subscriber: a full queue closes that subscription and leaves everyone else
//! untouched.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::StreamError;
use crate::topic::{TopicPattern, ALL_EVENTS};
use crate::types::NormalizedEvent;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1_024;

/// Identifier of one subscription within a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Routing table entry.
struct Binding {
    pattern: TopicPattern,
    sender: mpsc::Sender<NormalizedEvent>,
    overflowed: Arc<AtomicBool>,
}

struct RouterInner {
    bindings: RwLock<HashMap<SubscriptionId, Binding>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Publish/subscribe fabric. Cheap to clone; clones share one routing table.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl MessageRouter {
    /// Create a router whose subscribers buffer at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                bindings: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Per-subscriber buffer cap.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bind a new exclusive queue to `pattern`.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription, StreamError> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        self.write().insert(
            id,
            Binding {
                pattern: pattern.clone(),
                sender,
                overflowed: Arc::clone(&overflowed),
            },
        );
        tracing::debug!(%id, %pattern, "subscription bound");

        Ok(Subscription {
            id,
            pattern,
            receiver,
            router: self.clone(),
            overflowed,
            closed: false,
        })
    }

    /// Remove a binding. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.write().remove(&id).is_some() {
            tracing::debug!(%id, "subscription removed");
        }
    }

    /// Deliver `event` to every subscription whose pattern matches `topic`.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, topic: &str, event: &NormalizedEvent) -> usize {
        self.route(event, |pattern| pattern.matches(topic))
    }

    /// Route an event to its kind topic and to the aggregate topic.
    ///
    /// A subscriber bound to both receives the event once.
    pub fn publish_event(&self, event: &NormalizedEvent) -> usize {
        let topic = event.kind.topic();
        self.route(event, |pattern| pattern.matches(topic) || pattern.matches(ALL_EVENTS))
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    /// Distinct patterns currently referenced by at least one subscription.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.read().values().map(|b| b.pattern.to_string()).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    fn route(&self, event: &NormalizedEvent, wants: impl Fn(&TopicPattern) -> bool) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        {
            let bindings = self.read();
            for (id, binding) in bindings.iter().filter(|(_, b)| wants(&b.pattern)) {
                match binding.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        binding.overflowed.store(true, Ordering::Release);
                        let err = StreamError::SubscriberOverflow {
                            id: id.0,
                            capacity: self.inner.capacity,
                        };
                        tracing::warn!(%id, error = %err, "dropping slow subscriber");
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }

        if !dead.is_empty() {
            let mut bindings = self.write();
            for id in dead {
                bindings.remove(&id);
            }
        }
        delivered
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<SubscriptionId, Binding>> {
        self.inner.bindings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<SubscriptionId, Binding>> {
        self.inner.bindings.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving side of one binding.
///
/// Yields matching events as a [`Stream`]. Dropping or closing it removes the
/// binding from the router.
pub struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    receiver: mpsc::Receiver<NormalizedEvent>,
    router: MessageRouter,
    overflowed: Arc<AtomicBool>,
    closed: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }

    /// Returns `true` if the router dropped this subscription for falling
    /// behind.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Wait for the next event. `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        if self.closed {
            return None;
        }
        self.receiver.recv().await
    }

    /// Unbind and discard anything still buffered. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.router.unsubscribe(self.id);
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
    }
}

impl Stream for Subscription {
    type Item = NormalizedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("closed", &self.closed)
            .finish()
    }
}
