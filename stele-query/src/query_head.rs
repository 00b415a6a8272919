//! QueryHead - per-process latest pointer for a system
//!
//! Tracks the newest known event of every process belonging to a system.
//! Merges are monotonic: an update replaces a process's entry only when
//! its logical clock is strictly greater, so the reported head never
//! regresses. The value is always "current best knowledge";
//! `attempted_sources` tells callers which sources have been consulted.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use stele_model::{Process, SignedEvent, System};
use stele_net::ApiClient;
use stele_store::StateLayer;
use tracing::warn;

use crate::cancel::CancelContext;
use crate::shared::{deliver_to, BatchSink, Callback, CallbackSet, ServerSource, Source, Subscription};

/// Current best knowledge of a system's head.
#[derive(Debug, Clone)]
pub struct HeadSnapshot {
    pub system: System,
    /// Latest known event per process; never regresses
    pub head: BTreeMap<Process, SignedEvent>,
    pub attempted_sources: BTreeSet<Source>,
    /// True while first-load fetches are still outstanding; consumers
    /// must not treat an empty head as final until this clears
    pub loading: bool,
}

#[derive(Default)]
struct HeadState {
    head: BTreeMap<Process, SignedEvent>,
    attempted: BTreeSet<Source>,
    /// First-load fetches not yet answered (or failed)
    loading: BTreeSet<Source>,
    load_started: bool,
    callbacks: CallbackSet<HeadSnapshot>,
    holds: HashSet<u64>,
}

impl HeadState {
    fn snapshot(&self, system: System) -> HeadSnapshot {
        HeadSnapshot {
            system,
            head: self.head.clone(),
            attempted_sources: self.attempted.clone(),
            loading: !self.loading.is_empty(),
        }
    }

    /// Monotonic merge; true if anything advanced.
    fn merge(&mut self, event: &SignedEvent) -> bool {
        let ev = event.event();
        match self.head.get(&ev.process) {
            Some(existing) if existing.event().logical_clock >= ev.logical_clock => false,
            _ => {
                self.head.insert(ev.process, event.clone());
                true
            }
        }
    }
}

pub struct QueryHead {
    store: Arc<dyn StateLayer>,
    client: Arc<dyn ApiClient>,
    servers: Weak<dyn ServerSource>,
    sink: Weak<dyn BatchSink>,
    state: Mutex<HashMap<System, HeadState>>,
}

impl QueryHead {
    pub fn new(
        store: Arc<dyn StateLayer>,
        client: Arc<dyn ApiClient>,
        servers: Weak<dyn ServerSource>,
        sink: Weak<dyn BatchSink>,
    ) -> Self {
        Self {
            store,
            client,
            servers,
            sink,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` for a system's head. Invoked synchronously if
    /// anything is already known; the first subscriber triggers one disk
    /// load plus one head fetch per known server (deduplicated).
    pub fn query(
        self: &Arc<Self>,
        system: System,
        callback: Callback<HeadSnapshot>,
    ) -> Subscription {
        let (known, need_load) = {
            let mut state = self.state.lock().unwrap();
            let st = state.entry(system).or_default();
            st.callbacks.add(&callback);
            let known = if st.attempted.is_empty() && st.head.is_empty() {
                None
            } else {
                Some(st.snapshot(system))
            };
            let need_load = !st.load_started;
            st.load_started = true;
            (known, need_load)
        };

        if let Some(snapshot) = known {
            callback(&snapshot);
        }
        if need_load {
            self.spawn_loads(system);
        }

        let this = Arc::downgrade(self);
        let cb = callback.clone();
        Subscription::new(move || {
            if let Some(this) = this.upgrade() {
                this.unregister(system, &cb);
            }
        })
    }

    fn spawn_loads(self: &Arc<Self>, system: System) {
        let servers = match self.servers.upgrade() {
            Some(source) => source.servers(&system),
            None => Vec::new(),
        };
        {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&system) else {
                // Unsubscribed before the load could start
                return;
            };
            st.loading.insert(Source::Disk);
            for server in &servers {
                st.loading.insert(Source::Server(server.clone()));
            }
        }

        let disk = self.clone();
        tokio::spawn(async move {
            match disk.load_from_store(&system) {
                Ok(events) => disk.apply(system, Some(Source::Disk), &events),
                Err(err) => {
                    warn!(system = %system, error = %err, "head disk load failed");
                    disk.apply(system, Some(Source::Disk), &[]);
                }
            }
        });

        for server in servers {
            let this = self.clone();
            tokio::spawn(async move {
                match this.client.get_head(&server, &system).await {
                    Ok(events) => {
                        this.apply(system, Some(Source::Server(server)), &events);
                        deliver_to(&this.sink, &events);
                    }
                    Err(err) => {
                        warn!(server = %server, system = %system, error = %err, "head fetch failed");
                        // The source was consulted; drain it so the head
                        // stops reporting an outstanding load
                        this.apply(system, Some(Source::Server(server)), &[]);
                    }
                }
            });
        }
    }

    fn load_from_store(&self, system: &System) -> Result<Vec<SignedEvent>, stele_store::StoreError> {
        let mut events = Vec::new();
        for process_state in self.store.query_system_state(system)?.processes {
            if let Some(event) = self.store.get_signed_event(
                system,
                &process_state.process,
                process_state.head_clock,
            )? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Merge `events` into the system's head, marking `source` attempted.
    /// Emits to subscribers only if something changed.
    fn apply(&self, system: System, source: Option<Source>, events: &[SignedEvent]) {
        let emission = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&system) else {
                // All consumers released while the load was in flight
                return;
            };
            let mut changed = match source {
                Some(source) => {
                    let drained = st.loading.remove(&source);
                    st.attempted.insert(source) || drained
                }
                None => false,
            };
            for event in events {
                changed |= st.merge(event);
            }
            if changed {
                Some((st.snapshot(system), st.callbacks.snapshot()))
            } else {
                None
            }
        };

        if let Some((snapshot, callbacks)) = emission {
            for callback in callbacks {
                callback(&snapshot);
            }
        }
    }

    /// Idempotent push of a newly-observed event (local write or fan-out
    /// from a sibling query's load).
    pub fn update(&self, event: &SignedEvent) {
        self.apply(event.event().system, None, std::slice::from_ref(event));
    }

    /// Pin the system's head state for the lifetime of `hold`, applying
    /// `event` as in `update`.
    pub fn update_with_context_hold(self: &Arc<Self>, event: &SignedEvent, hold: &CancelContext) {
        let system = event.event().system;
        {
            let mut state = self.state.lock().unwrap();
            let st = state.entry(system).or_default();
            if !st.holds.insert(hold.id()) {
                // Same hold applied twice for this system; nothing to re-arm
                self.apply(system, None, std::slice::from_ref(event));
                return;
            }
        }
        self.apply(system, None, std::slice::from_ref(event));

        let this = Arc::downgrade(self);
        let hold_id = hold.id();
        hold.on_cancel(move || {
            if let Some(this) = this.upgrade() {
                this.release_hold(system, hold_id);
            }
        });
    }

    fn release_hold(&self, system: System, hold_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(st) = state.get_mut(&system) {
            st.holds.remove(&hold_id);
            if st.callbacks.is_empty() && st.holds.is_empty() {
                state.remove(&system);
            }
        }
    }

    fn unregister(&self, system: System, callback: &Callback<HeadSnapshot>) {
        let mut state = self.state.lock().unwrap();
        if let Some(st) = state.get_mut(&system) {
            st.callbacks.remove(callback);
            if st.callbacks.is_empty() && st.holds.is_empty() {
                state.remove(&system);
            }
        }
    }

    /// No cells remain: every subscriber and hold has been released.
    pub fn clean(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }
}

impl std::fmt::Debug for QueryHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHead").finish_non_exhaustive()
    }
}
