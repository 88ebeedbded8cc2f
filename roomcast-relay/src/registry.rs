use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::envelope::Envelope;

/// Callback invoked for every envelope received on the shard channels.
///
/// Handlers see every message regardless of room; filtering by room is
/// the handler's job.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Opaque token identifying a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

impl fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry of local handlers, keyed by monotonic token.
///
/// Mutation (`register`/`remove`) and dispatch run on different tasks,
/// so the map sits behind a lock and dispatch iterates over a snapshot.
/// A handler may therefore unsubscribe itself (or any other handler)
/// mid-dispatch without corrupting iteration.
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<u64, Handler>>,
    next_token: AtomicU64,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a handler, returning its unsubscribe token.
    pub fn register(&self, handler: Handler) -> SubscriptionToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().insert(token, handler);
        SubscriptionToken(token)
    }

    /// Remove a handler. Returns whether the token was registered.
    pub fn remove(&self, token: SubscriptionToken) -> bool {
        self.handlers.write().remove(&token.0).is_some()
    }

    /// Snapshot of the current handlers in token order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(SubscriptionToken, Handler)> {
        self.handlers
            .read()
            .iter()
            .map(|(token, handler)| (SubscriptionToken(*token), Arc::clone(handler)))
            .collect()
    }

    /// Drop all handlers.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
