//! QueryCrdtSet - latest-writer-wins element sets
//!
//! Derives the membership of a system's LWW element set (follows,
//! blocks, server announcements) from the QueryIndex timeline of the
//! same content type. Every add/remove operation in the window votes for
//! its element; per element the operation with the greatest
//! `(write time, process)` wins, and the element is a member iff that
//! winner is an add.
//!
//! Tombstones need no special casing here: when the timeline replaces a
//! deleted operation with its stand-in, the operation's vote disappears
//! with it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use stele_model::{ContentType, Process, SetOperation, SignedEvent, System};

use crate::query_index::{CellValue, IndexHandle, IndexPatch, QueryIndex};
use crate::shared::{Callback, CallbackSet};

/// Incremental membership change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetPatch {
    pub added: Vec<Vec<u8>>,
    pub removed: Vec<Vec<u8>>,
}

impl SetPatch {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct SetState {
    /// Votes per element value, keyed by the operation's slot
    entries: HashMap<Vec<u8>, BTreeMap<(Process, u64), (SetOperation, u64)>>,
    /// Current members
    present: BTreeSet<Vec<u8>>,
    index_handle: Option<IndexHandle>,
    handle_started: bool,
    callbacks: CallbackSet<SetPatch>,
}

impl SetState {
    fn vote_of(event: &SignedEvent) -> Option<(Vec<u8>, (Process, u64), SetOperation, u64)> {
        let ev = event.event();
        let set = ev.lww_element_set.as_ref()?;
        Some((
            set.value.clone(),
            (ev.process, ev.logical_clock),
            set.operation,
            set.unix_milliseconds,
        ))
    }

    fn remove_vote(&mut self, event: &SignedEvent) {
        if let Some((value, slot, _, _)) = Self::vote_of(event) {
            if let Some(votes) = self.entries.get_mut(&value) {
                votes.remove(&slot);
                if votes.is_empty() {
                    self.entries.remove(&value);
                }
            }
        }
    }

    fn add_vote(&mut self, event: &SignedEvent) {
        if let Some((value, slot, operation, time)) = Self::vote_of(event) {
            self.entries
                .entry(value)
                .or_default()
                .insert(slot, (operation, time));
        }
    }

    /// Recompute membership and diff against the last emission.
    fn diff(&mut self) -> SetPatch {
        let mut present = BTreeSet::new();
        for (value, votes) in &self.entries {
            let winner = votes
                .iter()
                .max_by_key(|((process, _), (_, time))| (*time, *process))
                .map(|(_, (operation, _))| *operation);
            if winner == Some(SetOperation::Add) {
                present.insert(value.clone());
            }
        }
        let added = present.difference(&self.present).cloned().collect();
        let removed = self.present.difference(&present).cloned().collect();
        self.present = present;
        SetPatch { added, removed }
    }
}

type Key = (System, ContentType);

/// Subscriber handle: widen the backing timeline with `advance`, detach
/// with `unsubscribe`.
pub struct CrdtSetHandle {
    query: Weak<QueryCrdtSet>,
    key: Key,
    callback: Callback<SetPatch>,
}

impl CrdtSetHandle {
    pub fn advance(&self, count: u64) {
        if let Some(query) = self.query.upgrade() {
            query.advance(self.key, count);
        }
    }

    pub fn unsubscribe(self) {
        if let Some(query) = self.query.upgrade() {
            query.unregister(self.key, &self.callback);
        }
    }
}

impl std::fmt::Debug for CrdtSetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtSetHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

pub struct QueryCrdtSet {
    index: Arc<QueryIndex>,
    state: Mutex<HashMap<Key, SetState>>,
}

impl QueryCrdtSet {
    pub fn new(index: Arc<QueryIndex>) -> Self {
        Self {
            index,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Register `callback` for a system's element set of one content
    /// type. Current members are delivered synchronously as one patch.
    pub fn query(
        self: &Arc<Self>,
        system: System,
        content_type: ContentType,
        callback: Callback<SetPatch>,
    ) -> CrdtSetHandle {
        let key = (system, content_type);
        let (initial, need_index_sub) = {
            let mut state = self.state.lock().unwrap();
            let st = state.entry(key).or_default();
            st.callbacks.add(&callback);
            let initial = if st.present.is_empty() {
                None
            } else {
                Some(SetPatch {
                    added: st.present.iter().cloned().collect(),
                    removed: Vec::new(),
                })
            };
            let need_index_sub = !st.handle_started;
            st.handle_started = true;
            (initial, need_index_sub)
        };

        if let Some(patch) = initial {
            callback(&patch);
        }
        if need_index_sub {
            let this = Arc::downgrade(self);
            let index_cb: Callback<IndexPatch> = Arc::new(move |patch| {
                if let Some(this) = this.upgrade() {
                    this.on_patch(key, patch);
                }
            });
            let handle = self.index.query(system, content_type, index_cb);
            let mut state = self.state.lock().unwrap();
            match state.get_mut(&key) {
                Some(st) => st.index_handle = Some(handle),
                None => {
                    drop(state);
                    handle.unsubscribe();
                }
            }
        }

        CrdtSetHandle {
            query: Arc::downgrade(self),
            key,
            callback,
        }
    }

    /// Fold a timeline patch into the vote table.
    fn on_patch(&self, key: Key, patch: &IndexPatch) {
        let emission = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&key) else {
                return;
            };
            for cell in &patch.removed {
                if let CellValue::Event(event) = &cell.value {
                    st.remove_vote(event);
                }
            }
            for cell in &patch.added {
                if let CellValue::Event(event) = &cell.value {
                    st.add_vote(event);
                }
            }
            let diff = st.diff();
            if diff.is_empty() {
                None
            } else {
                Some((diff, st.callbacks.snapshot()))
            }
        };

        if let Some((diff, callbacks)) = emission {
            for callback in callbacks {
                callback(&diff);
            }
        }
    }

    fn advance(&self, key: Key, count: u64) {
        let handle = {
            let state = self.state.lock().unwrap();
            state.get(&key).and_then(|st| st.index_handle.clone())
        };
        if let Some(handle) = handle {
            handle.advance(count);
        }
    }

    fn unregister(&self, key: Key, callback: &Callback<SetPatch>) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&key) else {
                return;
            };
            st.callbacks.remove(callback);
            if !st.callbacks.is_empty() {
                return;
            }
            state.remove(&key).and_then(|mut st| st.index_handle.take())
        };
        if let Some(handle) = handle {
            handle.unsubscribe();
        }
    }

    /// No element-set state remains.
    pub fn clean(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }
}

impl std::fmt::Debug for QueryCrdtSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCrdtSet").finish_non_exhaustive()
    }
}
