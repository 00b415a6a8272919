//! QueryServers - where to reach a system
//!
//! The union of two sources: locally-configured address hints and the
//! system's own replicated server announcements (the SERVER element
//! set). Hints are configuration, never reclaimed; announcement state
//! follows the usual subscriber lifetime.
//!
//! Every networked component resolves servers through this type, so a
//! freshly-announced server is picked up by the next load without any
//! re-subscription.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use stele_model::{content, System};
use tracing::warn;

use crate::query_crdt_set::{CrdtSetHandle, QueryCrdtSet, SetPatch};
use crate::shared::{Callback, CallbackSet, ServerSource, Subscription};

/// How far into the SERVER timeline announcements are pulled.
const ANNOUNCEMENT_WINDOW: u64 = 16;

#[derive(Default)]
struct ServersState {
    announced: BTreeSet<String>,
    set_handle: Option<CrdtSetHandle>,
    handle_started: bool,
    callbacks: CallbackSet<Vec<String>>,
}

pub struct QueryServers {
    /// Configured addresses; survives `clean`
    hints: Mutex<HashMap<System, BTreeSet<String>>>,
    state: Mutex<HashMap<System, ServersState>>,
    /// Attached after construction; announcements are unavailable (hints
    /// only) until then
    crdt_set: OnceLock<Arc<QueryCrdtSet>>,
}

impl QueryServers {
    pub fn new() -> Self {
        Self {
            hints: Mutex::new(HashMap::new()),
            state: Mutex::new(HashMap::new()),
            crdt_set: OnceLock::new(),
        }
    }

    /// Wire up the element-set component. Called once during engine
    /// assembly.
    pub(crate) fn attach(&self, crdt_set: Arc<QueryCrdtSet>) {
        let _ = self.crdt_set.set(crdt_set);
    }

    /// Add a locally-known address for a system.
    pub fn add_address_hint(&self, system: System, server: impl Into<String>) {
        let server = server.into();
        let changed = self
            .hints
            .lock()
            .unwrap()
            .entry(system)
            .or_default()
            .insert(server);
        if changed {
            self.emit(system);
        }
    }

    /// Register `callback` for a system's server list. The current union
    /// is delivered synchronously; the first subscriber starts following
    /// the system's SERVER announcements.
    pub fn query(
        self: &Arc<Self>,
        system: System,
        callback: Callback<Vec<String>>,
    ) -> Subscription {
        let need_set_sub = {
            let mut state = self.state.lock().unwrap();
            let st = state.entry(system).or_default();
            st.callbacks.add(&callback);
            let need = !st.handle_started;
            st.handle_started = true;
            need
        };

        callback(&self.servers_for(&system));

        if need_set_sub {
            if let Some(crdt_set) = self.crdt_set.get().cloned() {
                let this = Arc::downgrade(self);
                let set_cb: Callback<SetPatch> = Arc::new(move |patch| {
                    if let Some(this) = this.upgrade() {
                        this.on_patch(system, patch);
                    }
                });
                let handle = crdt_set.query(system, content::SERVER, set_cb);
                handle.advance(ANNOUNCEMENT_WINDOW);
                let mut state = self.state.lock().unwrap();
                match state.get_mut(&system) {
                    Some(st) => st.set_handle = Some(handle),
                    None => {
                        drop(state);
                        handle.unsubscribe();
                    }
                }
            }
        }

        let this = Arc::downgrade(self);
        let cb = callback.clone();
        Subscription::new(move || {
            if let Some(this) = this.upgrade() {
                this.unregister(system, &cb);
            }
        })
    }

    fn on_patch(&self, system: System, patch: &SetPatch) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&system) else {
                return;
            };
            let mut changed = false;
            for value in &patch.removed {
                if let Some(server) = decode_address(value) {
                    changed |= st.announced.remove(&server);
                }
            }
            for value in &patch.added {
                if let Some(server) = decode_address(value) {
                    changed |= st.announced.insert(server);
                }
            }
            changed
        };
        if changed {
            self.emit(system);
        }
    }

    fn emit(&self, system: System) {
        let callbacks = {
            let state = self.state.lock().unwrap();
            match state.get(&system) {
                Some(st) if !st.callbacks.is_empty() => st.callbacks.snapshot(),
                _ => return,
            }
        };
        let servers = self.servers_for(&system);
        for callback in callbacks {
            callback(&servers);
        }
    }

    fn servers_for(&self, system: &System) -> Vec<String> {
        let mut union: BTreeSet<String> = self
            .hints
            .lock()
            .unwrap()
            .get(system)
            .cloned()
            .unwrap_or_default();
        if let Some(st) = self.state.lock().unwrap().get(system) {
            union.extend(st.announced.iter().cloned());
        }
        union.into_iter().collect()
    }

    fn unregister(&self, system: System, callback: &Callback<Vec<String>>) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&system) else {
                return;
            };
            st.callbacks.remove(callback);
            if !st.callbacks.is_empty() {
                return;
            }
            state.remove(&system).and_then(|mut st| st.set_handle.take())
        };
        if let Some(handle) = handle {
            handle.unsubscribe();
        }
    }

    /// No announcement state remains. Address hints are configuration
    /// and do not count.
    pub fn clean(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }
}

impl Default for QueryServers {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSource for QueryServers {
    fn servers(&self, system: &System) -> Vec<String> {
        self.servers_for(system)
    }
}

fn decode_address(value: &[u8]) -> Option<String> {
    match std::str::from_utf8(value) {
        Ok(address) => Some(address.to_string()),
        Err(_) => {
            warn!("server announcement is not valid UTF-8; ignoring");
            None
        }
    }
}

impl std::fmt::Debug for QueryServers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryServers").finish_non_exhaustive()
    }
}
