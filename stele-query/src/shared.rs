//! Shared cache/subscription machinery
//!
//! Callback sets keyed by `Arc` pointer identity, unsubscribe handles,
//! and the two wiring seams every component shares: `BatchSink` (fan-out
//! of loaded batches) and `ServerSource` (which servers to consult for a
//! system).
//!
//! Locking discipline: component state lives behind a `Mutex`; callbacks
//! are snapshotted under the lock and invoked after it is released, so a
//! callback may re-enter `query`/`advance`/`unsubscribe` freely.

use std::sync::{Arc, Weak};

use stele_model::{SignedEvent, System};

/// Subscriber callback. Registering the same `Arc` twice under one key is
/// a caller bug and fails fast.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of callbacks with pointer-identity membership.
pub struct CallbackSet<T> {
    entries: Vec<Callback<T>>,
}

impl<T> CallbackSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Panics if `callback` is already registered.
    pub fn add(&mut self, callback: &Callback<T>) {
        assert!(
            !self.entries.iter().any(|c| Arc::ptr_eq(c, callback)),
            "callback already registered for this key"
        );
        self.entries.push(callback.clone());
    }

    pub fn remove(&mut self, callback: &Callback<T>) {
        self.entries.retain(|c| !Arc::ptr_eq(c, callback));
    }

    /// Copy of the current callbacks, for invocation outside the state
    /// lock. Tolerates registrations/removals while iterating the copy.
    pub fn snapshot(&self) -> Vec<Callback<T>> {
        self.entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for CallbackSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CallbackSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CallbackSet(len={})", self.entries.len())
    }
}

/// Handle returned by `query(...)`. Dropping it without calling
/// `unsubscribe` leaves the callback registered.
#[must_use = "dropping a Subscription without unsubscribing leaks the registration"]
pub struct Subscription {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscription")
    }
}

/// Where a piece of data came from. Per-source bookkeeping lets callers
/// distinguish "nothing found yet" from "nothing tried yet".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Disk,
    Server(String),
    /// Live ingestion or fan-out from a sibling query
    Unknown,
}

/// Fan-out target: every batch a component loads from the network is
/// handed here, to be ingested into the durable store and pushed to every
/// other component's `update`. Disk-loaded batches are deliberately not
/// fanned out: the store is the shared substrate, so sibling components
/// already find that data on their own disk pass.
pub trait BatchSink: Send + Sync {
    fn deliver(&self, events: &[SignedEvent]);
}

/// Which servers to consult for a system right now (address hints plus
/// whatever the replicated server set has resolved to so far).
pub trait ServerSource: Send + Sync {
    fn servers(&self, system: &System) -> Vec<String>;
}

/// Deliver a loaded batch to the sink, if the manager is still alive.
pub(crate) fn deliver_to(sink: &Weak<dyn BatchSink>, events: &[SignedEvent]) {
    if events.is_empty() {
        return;
    }
    if let Some(sink) = sink.upgrade() {
        sink.deliver(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    #[should_panic(expected = "callback already registered")]
    fn test_duplicate_callback_panics() {
        let mut set: CallbackSet<u32> = CallbackSet::new();
        let cb: Callback<u32> = Arc::new(|_| {});
        set.add(&cb);
        set.add(&cb);
    }

    #[test]
    fn test_distinct_callbacks_coexist() {
        let mut set: CallbackSet<u32> = CallbackSet::new();
        let a: Callback<u32> = Arc::new(|_| {});
        let b: Callback<u32> = Arc::new(|_| {});
        set.add(&a);
        set.add(&b);
        assert_eq!(set.snapshot().len(), 2);
        set.remove(&a);
        assert_eq!(set.snapshot().len(), 1);
    }

    #[test]
    fn test_subscription_runs_unregister_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let sub = Subscription::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
