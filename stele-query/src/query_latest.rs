//! QueryCrdt - latest-writer-wins register values
//!
//! Derives the current value of a system's LWW register for one content
//! type by composing QueryHead (which process wrote what, and when) with
//! QueryEvent (fetching the referenced writes). Each process's head
//! either is the candidate write itself or points at it through the
//! head's per-type index, one hop away.
//!
//! The winner is the candidate with the greatest `(write time, process)`;
//! a tombstoned candidate removes that process from contention. While
//! referenced writes are still loading the emitted value carries
//! `missing_data = true`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use stele_model::{content, ContentType, Process, SignedEvent, System};
use tracing::warn;

use crate::query_event::QueryEvent;
use crate::query_head::{HeadSnapshot, QueryHead};
use crate::shared::{Callback, CallbackSet, Subscription};

/// Resolved register value for one `(system, content type)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CrdtValue {
    /// Winning register value; `None` when unset or deleted
    pub value: Option<Vec<u8>>,
    /// The event that wrote the winning value
    pub event: Option<SignedEvent>,
    /// True while referenced writes are still being fetched
    pub missing_data: bool,
}

struct LatestState {
    /// Newest write of the type per process (may be a tombstone stand-in)
    candidates: BTreeMap<Process, SignedEvent>,
    /// Referenced writes still in flight: process -> wanted clock
    pending: BTreeMap<Process, u64>,
    /// True while the head's own first-load fetches are outstanding; an
    /// empty candidate set is not final until this clears
    head_loading: bool,
    head_sub: Option<Subscription>,
    head_sub_started: bool,
    /// Live one-hop event subscriptions, keyed by slot
    event_subs: HashMap<(Process, u64), Subscription>,
    callbacks: CallbackSet<CrdtValue>,
    /// Last emitted value, for deduplication
    last: Option<CrdtValue>,
}

impl Default for LatestState {
    fn default() -> Self {
        Self {
            candidates: BTreeMap::new(),
            pending: BTreeMap::new(),
            head_loading: true,
            head_sub: None,
            head_sub_started: false,
            event_subs: HashMap::new(),
            callbacks: CallbackSet::new(),
            last: None,
        }
    }
}

impl LatestState {
    fn compute(&self) -> CrdtValue {
        let mut best: Option<&SignedEvent> = None;
        for candidate in self.candidates.values() {
            let ev = candidate.event();
            if ev.content_type == content::DELETE {
                continue;
            }
            let Some(lww) = &ev.lww_element else {
                continue;
            };
            let better = match best {
                None => true,
                Some(current) => {
                    let current_lww = current
                        .event()
                        .lww_element
                        .as_ref()
                        .map(|l| l.unix_milliseconds)
                        .unwrap_or(0);
                    (lww.unix_milliseconds, ev.process)
                        > (current_lww, current.event().process)
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        CrdtValue {
            value: best.and_then(|e| e.event().lww_element.as_ref().map(|l| l.value.clone())),
            event: best.cloned(),
            missing_data: !self.pending.is_empty() || self.head_loading,
        }
    }

    /// Recompute and dedupe; `Some` means the value changed and must be
    /// emitted after the lock is released.
    fn emission(&mut self) -> Option<(CrdtValue, Vec<Callback<CrdtValue>>)> {
        let value = self.compute();
        if self.last.as_ref() == Some(&value) {
            return None;
        }
        self.last = Some(value.clone());
        Some((value, self.callbacks.snapshot()))
    }
}

type Key = (System, ContentType);

pub struct QueryCrdt {
    head: Arc<QueryHead>,
    events: Arc<QueryEvent>,
    state: Mutex<HashMap<Key, LatestState>>,
}

impl QueryCrdt {
    pub fn new(head: Arc<QueryHead>, events: Arc<QueryEvent>) -> Self {
        Self {
            head,
            events,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` for a system's register value. Emits once per
    /// distinct value, including intermediate `missing_data` states.
    pub fn query(
        self: &Arc<Self>,
        system: System,
        content_type: ContentType,
        callback: Callback<CrdtValue>,
    ) -> Subscription {
        let key = (system, content_type);
        let (known, need_head_sub) = {
            let mut state = self.state.lock().unwrap();
            let st = state.entry(key).or_default();
            st.callbacks.add(&callback);
            let need_head_sub = !st.head_sub_started;
            st.head_sub_started = true;
            (st.last.clone(), need_head_sub)
        };

        if let Some(value) = known {
            callback(&value);
        }
        if need_head_sub {
            let this = Arc::downgrade(self);
            let head_cb: Callback<HeadSnapshot> = Arc::new(move |snapshot| {
                if let Some(this) = this.upgrade() {
                    this.on_head(key, snapshot);
                }
            });
            let sub = self.head.query(system, head_cb);
            let mut state = self.state.lock().unwrap();
            match state.get_mut(&key) {
                Some(st) => st.head_sub = Some(sub),
                // Everyone unsubscribed while the head subscription was
                // being created
                None => {
                    drop(state);
                    sub.unsubscribe();
                }
            }
        }

        let this = Arc::downgrade(self);
        let cb = callback.clone();
        Subscription::new(move || {
            if let Some(this) = this.upgrade() {
                this.unregister(key, &cb);
            }
        })
    }

    /// Fold a head snapshot in: direct candidates where the head event is
    /// itself the newest write of the type, one-hop subscriptions where
    /// the head only points at it.
    fn on_head(self: &Arc<Self>, key: Key, snapshot: &HeadSnapshot) {
        let (system, content_type) = key;
        let mut to_subscribe: Vec<(Process, u64)> = Vec::new();
        let mut to_unsubscribe: Vec<Subscription> = Vec::new();

        let emission = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&key) else {
                return;
            };
            st.head_loading = snapshot.loading;

            for (process, head_event) in &snapshot.head {
                let ev = head_event.event();
                let wanted = if ev.content_type == content_type {
                    Some(ev.logical_clock)
                } else {
                    ev.indices.get(content_type)
                };

                let Some(wanted_clock) = wanted else {
                    // Head says this process has never written the type
                    st.candidates.remove(process);
                    st.pending.remove(process);
                    continue;
                };

                if ev.content_type == content_type {
                    st.candidates.insert(*process, head_event.clone());
                    st.pending.remove(process);
                    // The head itself is newer than anything in flight
                    to_unsubscribe.extend(
                        drain_process_subs(&mut st.event_subs, process, None),
                    );
                    continue;
                }

                if st.event_subs.contains_key(&(*process, wanted_clock)) {
                    continue;
                }
                let already_resolved = st
                    .candidates
                    .get(process)
                    .map(|c| candidate_covers(c, *process, wanted_clock))
                    .unwrap_or(false);
                if already_resolved {
                    continue;
                }
                to_unsubscribe.extend(drain_process_subs(
                    &mut st.event_subs,
                    process,
                    Some(wanted_clock),
                ));
                st.pending.insert(*process, wanted_clock);
                to_subscribe.push((*process, wanted_clock));
            }

            st.emission()
        };

        if let Some((value, callbacks)) = emission {
            for callback in callbacks {
                callback(&value);
            }
        }
        for sub in to_unsubscribe {
            sub.unsubscribe();
        }

        for (process, clock) in to_subscribe {
            let this = Arc::downgrade(self);
            let event_cb: Callback<SignedEvent> = Arc::new(move |event| {
                if let Some(this) = this.upgrade() {
                    this.on_event(key, process, clock, event);
                }
            });
            let sub = self.events.query(system, process, clock, event_cb);
            let mut state = self.state.lock().unwrap();
            match state.get_mut(&key) {
                Some(st) => {
                    if let Some(stale) = st.event_subs.insert((process, clock), sub) {
                        drop(state);
                        stale.unsubscribe();
                    }
                }
                None => {
                    drop(state);
                    sub.unsubscribe();
                }
            }
        }
    }

    /// A referenced write (or its tombstone) resolved.
    fn on_event(&self, key: Key, process: Process, clock: u64, event: &SignedEvent) {
        let emission = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&key) else {
                return;
            };
            // The subscription may resolve synchronously, before its
            // handle is stored; the pending entry covers that window
            let live = st.event_subs.contains_key(&(process, clock))
                || st.pending.get(&process) == Some(&clock);
            if !live {
                // Superseded by a newer head while in flight
                return;
            }
            if event.event().content_type != content::DELETE
                && event.event().content_type != key.1
            {
                warn!(expected = key.1, got = event.event().content_type,
                    "referenced write has wrong content type; ignoring");
                return;
            }
            st.candidates.insert(process, event.clone());
            st.pending.remove(&process);
            st.emission()
        };

        if let Some((value, callbacks)) = emission {
            for callback in callbacks {
                callback(&value);
            }
        }
    }

    fn unregister(&self, key: Key, callback: &Callback<CrdtValue>) {
        let subs = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&key) else {
                return;
            };
            st.callbacks.remove(callback);
            if !st.callbacks.is_empty() {
                return;
            }
            let mut st = state.remove(&key).unwrap_or_default();
            let mut subs: Vec<Subscription> = st.event_subs.drain().map(|(_, s)| s).collect();
            subs.extend(st.head_sub.take());
            subs
        };
        for sub in subs {
            sub.unsubscribe();
        }
    }

    /// No register state remains.
    pub fn clean(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }
}

/// True if `candidate` already answers the slot `(process, clock)`:
/// either it is the event at that slot, or it is the delete tombstoning
/// that slot.
fn candidate_covers(candidate: &SignedEvent, process: Process, clock: u64) -> bool {
    let ev = candidate.event();
    if ev.process == process && ev.logical_clock == clock {
        return true;
    }
    match ev.delete_payload() {
        Ok(Some(delete)) => delete.process == process && delete.logical_clock == clock,
        _ => false,
    }
}

/// Remove this process's event subscriptions, keeping `keep` if given.
fn drain_process_subs(
    subs: &mut HashMap<(Process, u64), Subscription>,
    process: &Process,
    keep: Option<u64>,
) -> Vec<Subscription> {
    let stale: Vec<(Process, u64)> = subs
        .keys()
        .filter(|(p, c)| p == process && keep != Some(*c))
        .copied()
        .collect();
    stale.into_iter().filter_map(|k| subs.remove(&k)).collect()
}

impl std::fmt::Debug for QueryCrdt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCrdt").finish_non_exhaustive()
    }
}
