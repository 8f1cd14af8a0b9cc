//! Typed listener registration
//!
//! Listeners subscribe with a closure and get back an id they can later use
//! to unsubscribe. Notification runs the callbacks inline on the notifying
//! task, so callbacks must be short and must not block.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by [`ListenerRegistry::subscribe`]
pub type SubscriptionId = u64;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct ListenerRegistry<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(SubscriptionId, Listener<E>)>>,
}

impl<E> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the id was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn notify(&self, event: &E) {
        // Snapshot so a callback may (un)subscribe without deadlocking
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry").field("listeners", &self.len()).finish()
    }
}

/// Where a local entry change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventOrigin {
    /// Decided on this node as primary, or applied by an owner's fast path
    Local,
    /// Applied on behalf of another node's decision
    Replica,
}

/// Change to an entry in this node's local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CacheEvent {
    EntryWritten { key: String, value: String, origin: EventOrigin },
    EntryRemoved { key: String, origin: EventOrigin },
    /// Dropped from this node only
    EntryEvicted { key: String },
}

impl CacheEvent {
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::EntryWritten { key, .. }
            | CacheEvent::EntryRemoved { key, .. }
            | CacheEvent::EntryEvicted { key } => key,
        }
    }
}
