//! Routing of `eth_subscription` pushes to their listeners.
//!
//! Subscriptions belong to one socket. When it drops, [`SubscriptionManager::clear`]
//! closes every listener channel so consumers observe the end of their stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;

/// A unique subscription ID returned by `eth_subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Active subscriptions of one socket.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<Value>>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, mpsc::UnboundedSender<Value>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subscription.
    pub fn register(&self, id: SubscriptionId) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Forward an incoming notification to the correct subscription.
    ///
    /// Returns `false` if no listener is registered under `id`.
    pub fn dispatch(&self, id: &SubscriptionId, message: Value) -> bool {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(sender) if sender.send(message).is_ok() => true,
            Some(_) => {
                entries.remove(id);
                false
            }
            None => false,
        }
    }

    /// Remove a subscription (e.g. after `eth_unsubscribe`).
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Drop every listener; their streams end.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
