//! QueryEvent - point cache for single events
//!
//! One cell per `(system, process, logical_clock)` slot. A cell resolves
//! at most once: either to the original event at the slot or to the
//! delete event tombstoning it. Tombstones always win, and a delete links
//! its own slot and its target slot as siblings so the pair is reclaimed
//! together.
//!
//! Per-server requests batch every outstanding clock of the system into
//! one range-based fetch, and each server is asked about a slot at most
//! once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use stele_model::{content, Process, RangeSet, SignedEvent, System};
use stele_net::{ApiClient, RangesForProcess};
use stele_store::StateLayer;
use tracing::warn;

use crate::cancel::CancelContext;
use crate::shared::{deliver_to, BatchSink, Callback, CallbackSet, ServerSource, Subscription};

struct EventCell {
    system: System,
    process: Process,
    logical_clock: u64,
    /// Resolved value: the slot's event, or the delete tombstoning it
    value: Option<SignedEvent>,
    callbacks: CallbackSet<SignedEvent>,
    holds: HashSet<u64>,
    /// Paired cell: a delete's own slot <-> the slot it deletes
    sibling: Option<u64>,
    attempted_servers: HashSet<String>,
    disk_attempted: bool,
}

impl EventCell {
    fn new(system: System, process: Process, logical_clock: u64) -> Self {
        Self {
            system,
            process,
            logical_clock,
            value: None,
            callbacks: CallbackSet::new(),
            holds: HashSet::new(),
            sibling: None,
            attempted_servers: HashSet::new(),
            disk_attempted: false,
        }
    }

    fn unneeded(&self) -> bool {
        self.callbacks.is_empty() && self.holds.is_empty()
    }
}

#[derive(Default)]
struct EventState {
    cells: HashMap<u64, EventCell>,
    index: HashMap<System, HashMap<Process, HashMap<u64, u64>>>,
    next_cell: u64,
}

type Emission = (Vec<Callback<SignedEvent>>, SignedEvent);

impl EventState {
    fn cell_id(&self, system: &System, process: &Process, logical_clock: u64) -> Option<u64> {
        self.index
            .get(system)?
            .get(process)?
            .get(&logical_clock)
            .copied()
    }

    fn ensure_cell(&mut self, system: System, process: Process, logical_clock: u64) -> u64 {
        if let Some(id) = self.cell_id(&system, &process, logical_clock) {
            return id;
        }
        let id = self.next_cell;
        self.next_cell += 1;
        self.cells
            .insert(id, EventCell::new(system, process, logical_clock));
        self.index
            .entry(system)
            .or_default()
            .entry(process)
            .or_default()
            .insert(logical_clock, id);
        id
    }

    fn remove_cell(&mut self, id: u64) {
        if let Some(cell) = self.cells.remove(&id) {
            if let Some(by_process) = self.index.get_mut(&cell.system) {
                if let Some(by_clock) = by_process.get_mut(&cell.process) {
                    by_clock.remove(&cell.logical_clock);
                    if by_clock.is_empty() {
                        by_process.remove(&cell.process);
                    }
                }
                if by_process.is_empty() {
                    self.index.remove(&cell.system);
                }
            }
        }
    }

    /// Reclaim `id` (and its sibling) once no consumers remain on either
    /// side of the pair.
    fn maybe_reclaim(&mut self, id: u64) {
        let Some(cell) = self.cells.get(&id) else {
            return;
        };
        if !cell.unneeded() {
            return;
        }
        match cell.sibling {
            Some(sibling) => {
                let sibling_unneeded = self
                    .cells
                    .get(&sibling)
                    .map(|c| c.unneeded())
                    .unwrap_or(true);
                if sibling_unneeded {
                    self.remove_cell(id);
                    self.remove_cell(sibling);
                }
            }
            None => self.remove_cell(id),
        }
    }

    /// Resolve a cell's value. Tombstones win; anything else is
    /// first-write-wins (slots are immutable, so later values are
    /// duplicates).
    fn set_value(&mut self, id: u64, event: &SignedEvent, emissions: &mut Vec<Emission>) {
        let Some(cell) = self.cells.get_mut(&id) else {
            return;
        };
        let incoming_is_delete = event.event().content_type == content::DELETE;
        match &cell.value {
            Some(existing) => {
                let existing_is_delete = existing.event().content_type == content::DELETE;
                if existing_is_delete || !incoming_is_delete {
                    return;
                }
            }
            None => {}
        }
        cell.value = Some(event.clone());
        if !cell.callbacks.is_empty() {
            emissions.push((cell.callbacks.snapshot(), event.clone()));
        }
    }

    /// Apply one event to existing cells, creating only the sibling cell
    /// a delete needs to pair its two slots.
    fn apply(&mut self, event: &SignedEvent, emissions: &mut Vec<Emission>) {
        let ev = event.event();
        let delete = match ev.delete_payload() {
            Ok(delete) => delete,
            Err(err) => {
                warn!(error = %err, "undecodable delete payload; ignoring event");
                return;
            }
        };

        match delete {
            None => {
                if let Some(id) = self.cell_id(&ev.system, &ev.process, ev.logical_clock) {
                    self.set_value(id, event, emissions);
                }
            }
            Some(delete) => {
                let own = self.cell_id(&ev.system, &ev.process, ev.logical_clock);
                let target = self.cell_id(&ev.system, &delete.process, delete.logical_clock);
                if own.is_none() && target.is_none() {
                    return;
                }

                if let Some(target_id) = target {
                    if let Some(Some(existing)) = self.cells.get(&target_id).map(|c| &c.value) {
                        let inner = existing.event();
                        // The slot's original content was itself a delete:
                        // a signed event can never legitimately say that.
                        assert!(
                            !(inner.content_type == content::DELETE
                                && inner.process == delete.process
                                && inner.logical_clock == delete.logical_clock),
                            "delete targets a delete event"
                        );
                    }
                }

                let own = own.unwrap_or_else(|| {
                    self.ensure_cell(ev.system, ev.process, ev.logical_clock)
                });
                let target = target.unwrap_or_else(|| {
                    self.ensure_cell(ev.system, delete.process, delete.logical_clock)
                });
                if own != target {
                    if let Some(cell) = self.cells.get_mut(&own) {
                        cell.sibling = Some(target);
                    }
                    if let Some(cell) = self.cells.get_mut(&target) {
                        cell.sibling = Some(own);
                    }
                }
                self.set_value(own, event, emissions);
                self.set_value(target, event, emissions);
            }
        }
    }

    /// Unresolved clocks of `system`, per process, that `server` has not
    /// been asked about yet. Marks them attempted.
    fn take_outstanding(&mut self, system: &System, server: &str) -> Vec<RangesForProcess> {
        let mut by_process: HashMap<Process, RangeSet> = HashMap::new();
        for cell in self.cells.values_mut() {
            if cell.system == *system
                && cell.value.is_none()
                && !cell.attempted_servers.contains(server)
            {
                cell.attempted_servers.insert(server.to_string());
                by_process
                    .entry(cell.process)
                    .or_default()
                    .insert(cell.logical_clock);
            }
        }
        by_process
            .into_iter()
            .map(|(process, ranges)| RangesForProcess { process, ranges })
            .collect()
    }
}

pub struct QueryEvent {
    store: Arc<dyn StateLayer>,
    client: Arc<dyn ApiClient>,
    servers: Weak<dyn ServerSource>,
    sink: Weak<dyn BatchSink>,
    state: Mutex<EventState>,
}

impl QueryEvent {
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
            state: Mutex::new(EventState::default()),
        }
    }

    /// Register `callback` for the event at one slot. Invoked
    /// synchronously if the slot is already resolved (in the cache or on
    /// disk), otherwise exactly once when it resolves (to the event or
    /// its tombstone). Only a slot the store does not hold goes to the
    /// network.
    pub fn query(
        self: &Arc<Self>,
        system: System,
        process: Process,
        logical_clock: u64,
        callback: Callback<SignedEvent>,
    ) -> Subscription {
        let (known, need_disk) = {
            let mut state = self.state.lock().unwrap();
            let id = state.ensure_cell(system, process, logical_clock);
            let cell = state.cells.get_mut(&id).unwrap();
            cell.callbacks.add(&callback);
            let known = cell.value.clone();
            let need_disk = known.is_none() && !cell.disk_attempted;
            cell.disk_attempted = true;
            (known, need_disk)
        };

        if let Some(event) = known {
            callback(&event);
        } else {
            if need_disk {
                match self.store.get_signed_event(&system, &process, logical_clock) {
                    Ok(Some(event)) => self.apply_events(std::slice::from_ref(&event)),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(system = %system, error = %err, "event disk load failed");
                    }
                }
            }
            let resolved = {
                let state = self.state.lock().unwrap();
                state
                    .cell_id(&system, &process, logical_clock)
                    .and_then(|id| state.cells.get(&id))
                    .map(|cell| cell.value.is_some())
                    .unwrap_or(false)
            };
            if !resolved {
                self.spawn_server_loads(system);
            }
        }

        let this = Arc::downgrade(self);
        let cb = callback.clone();
        Subscription::new(move || {
            if let Some(this) = this.upgrade() {
                this.unregister(system, process, logical_clock, &cb);
            }
        })
    }

    /// One request per known server, carrying every outstanding slot of
    /// the system that server has not seen yet.
    fn spawn_server_loads(self: &Arc<Self>, system: System) {
        let servers = match self.servers.upgrade() {
            Some(source) => source.servers(&system),
            None => Vec::new(),
        };
        for server in servers {
            let ranges = {
                let mut state = self.state.lock().unwrap();
                state.take_outstanding(&system, &server)
            };
            if ranges.is_empty() {
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                match this.client.get_events(&server, &system, &ranges).await {
                    Ok(events) => {
                        this.apply_events(&events);
                        deliver_to(&this.sink, &events);
                    }
                    Err(err) => {
                        warn!(server = %server, system = %system, error = %err, "event fetch failed");
                    }
                }
            });
        }
    }

    fn apply_events(&self, events: &[SignedEvent]) {
        let emissions = {
            let mut state = self.state.lock().unwrap();
            let mut emissions = Vec::new();
            for event in events {
                state.apply(event, &mut emissions);
            }
            emissions
        };
        for (callbacks, event) in emissions {
            for callback in callbacks {
                callback(&event);
            }
        }
    }

    /// Idempotent push of a newly-observed event. Only touches slots that
    /// already have consumers.
    pub fn update(&self, event: &SignedEvent) {
        self.apply_events(std::slice::from_ref(event));
    }

    /// Pin `event`'s slot for the lifetime of `hold`, then apply it.
    pub fn update_with_context_hold(self: &Arc<Self>, event: &SignedEvent, hold: &CancelContext) {
        let ev = event.event();
        let (system, process, logical_clock) = (ev.system, ev.process, ev.logical_clock);
        let newly_held = {
            let mut state = self.state.lock().unwrap();
            let id = state.ensure_cell(system, process, logical_clock);
            state.cells.get_mut(&id).unwrap().holds.insert(hold.id())
        };
        self.apply_events(std::slice::from_ref(event));

        if newly_held {
            let this = Arc::downgrade(self);
            let hold_id = hold.id();
            hold.on_cancel(move || {
                if let Some(this) = this.upgrade() {
                    this.release_hold(system, process, logical_clock, hold_id);
                }
            });
        }
    }

    fn release_hold(&self, system: System, process: Process, logical_clock: u64, hold_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.cell_id(&system, &process, logical_clock) {
            if let Some(cell) = state.cells.get_mut(&id) {
                cell.holds.remove(&hold_id);
            }
            state.maybe_reclaim(id);
        }
    }

    fn unregister(
        &self,
        system: System,
        process: Process,
        logical_clock: u64,
        callback: &Callback<SignedEvent>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.cell_id(&system, &process, logical_clock) {
            if let Some(cell) = state.cells.get_mut(&id) {
                cell.callbacks.remove(callback);
            }
            state.maybe_reclaim(id);
        }
    }

    /// No cells remain: every subscriber and hold has been released.
    pub fn clean(&self) -> bool {
        self.state.lock().unwrap().cells.is_empty()
    }
}

impl std::fmt::Debug for QueryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEvent").finish_non_exhaustive()
    }
}
