//! CancelContext - cooperative cancellation handle
//!
//! A cheap shared handle: reference-counted flag plus callback list.
//! Cancellation is idempotent and safe to call after teardown. Components
//! use it as the "context hold" side of cache-cell ownership: a cell
//! pinned by a hold lives until the hold is cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

enum State {
    Active(Vec<Box<dyn FnOnce() + Send>>),
    Cancelled,
}

struct Inner {
    id: u64,
    state: Mutex<State>,
}

/// Shared cancellation token. Clones observe the same state.
#[derive(Clone)]
pub struct CancelContext {
    inner: Arc<Inner>,
}

impl CancelContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State::Active(Vec::new())),
            }),
        }
    }

    /// Stable identity of this context, shared by all clones.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cancelled(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Cancelled)
    }

    /// Cancel, running all registered callbacks once. Further calls are
    /// no-ops.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock().unwrap();
            match std::mem::replace(&mut *state, State::Cancelled) {
                State::Active(callbacks) => callbacks,
                State::Cancelled => Vec::new(),
            }
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Register a callback to run on cancellation. Runs immediately if
    /// already cancelled.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let State::Active(callbacks) = &mut *state {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelContext")
            .field("id", &self.inner.id)
            .field("cancelled", &self.cancelled())
            .finish()
    }
}
