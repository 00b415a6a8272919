//! QueryIndex - descending timeline with gap detection
//!
//! Maintains, per `(system, content type)`, a contiguous window of the
//! newest events of that type, merged from disk and every known server.
//! Subscribers receive incremental patches (cells added / removed) and
//! pull the window downward with `advance`.
//!
//! Each event carries the logical clock of its author's previous write of
//! the same type. Walking those links inside the loaded window exposes
//! holes: an event referenced by the chain but absent from the window
//! first gets a point lookup against the store, then a `Missing`
//! placeholder cell that is replaced when the real event arrives.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use stele_model::{content, ContentType, Process, SignedEvent, System};
use stele_net::ApiClient;
use stele_store::StateLayer;
use tracing::warn;

use crate::shared::{deliver_to, BatchSink, Callback, CallbackSet, ServerSource, Source};

/// Position of a cell in the descending timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellKey {
    pub unix_milliseconds: u64,
    pub process: Process,
    pub logical_clock: u64,
}

/// Cell contents: a resolved event (possibly a tombstone stand-in) or a
/// placeholder for a detected hole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Event(SignedEvent),
    Missing,
}

/// One slot of the timeline window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCell {
    pub key: CellKey,
    /// Logical clock of the author's previous write of this type
    pub next: Option<u64>,
    pub value: CellValue,
}

/// Incremental change to the window.
#[derive(Debug, Clone, Default)]
pub struct IndexPatch {
    pub added: Vec<IndexCell>,
    pub removed: Vec<IndexCell>,
}

impl IndexPatch {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Where an event sits in this timeline. A delete stand-in occupies the
/// deleted event's original position.
fn slot_info(event: &SignedEvent, content_type: ContentType) -> Option<(CellKey, Option<u64>)> {
    let ev = event.event();
    if ev.content_type == content_type {
        return Some((
            CellKey {
                unix_milliseconds: ev.unix_milliseconds,
                process: ev.process,
                logical_clock: ev.logical_clock,
            },
            ev.indices.get(content_type),
        ));
    }
    if ev.content_type == content::DELETE {
        if let Ok(Some(delete)) = ev.delete_payload() {
            if delete.content_type == content_type {
                return Some((
                    CellKey {
                        unix_milliseconds: delete.unix_milliseconds,
                        process: delete.process,
                        logical_clock: delete.logical_clock,
                    },
                    delete.indices.get(content_type),
                ));
            }
        }
    }
    None
}

#[derive(Default)]
struct IndexState {
    /// Window cells, descending by key
    cells: Vec<IndexCell>,
    callbacks: CallbackSet<IndexPatch>,
    /// How many resolved cells subscribers have asked for in total
    requested: u64,
    /// Next cursor per source; absent means "from the top"
    cursors: HashMap<Source, u64>,
    exhausted: HashSet<Source>,
    loading: HashSet<Source>,
}

impl IndexState {
    fn position_of(&self, process: &Process, logical_clock: u64) -> Option<usize> {
        self.cells
            .iter()
            .position(|c| c.key.process == *process && c.key.logical_clock == logical_clock)
    }

    fn insert_sorted(&mut self, cell: IndexCell, patch: &mut IndexPatch) {
        let pos = self.cells.partition_point(|c| c.key > cell.key);
        self.cells.insert(pos, cell.clone());
        patch.added.push(cell);
    }

    /// Merge one event into the window. Placeholders and deleted
    /// originals are replaced; anything else is idempotent.
    fn merge_event(
        &mut self,
        event: &SignedEvent,
        content_type: ContentType,
        patch: &mut IndexPatch,
    ) {
        let Some((key, next)) = slot_info(event, content_type) else {
            return;
        };
        let cell = IndexCell {
            key,
            next,
            value: CellValue::Event(event.clone()),
        };
        match self.position_of(&key.process, key.logical_clock) {
            Some(pos) => {
                let existing = &self.cells[pos];
                let replace = match &existing.value {
                    CellValue::Missing => true,
                    CellValue::Event(old) => {
                        // Tombstone wins over the event it deletes
                        old.event().content_type != content::DELETE
                            && event.event().content_type == content::DELETE
                    }
                };
                if replace {
                    let old = self.cells.remove(pos);
                    patch.removed.push(old);
                    self.insert_sorted(cell, patch);
                }
            }
            None => self.insert_sorted(cell, patch),
        }
    }

    /// Walk previous-write links inside the window; each hole gets a
    /// store point-lookup and then, failing that, a placeholder. Runs to
    /// a fixed point.
    fn fill_gaps(
        &mut self,
        store: &dyn StateLayer,
        system: &System,
        content_type: ContentType,
        patch: &mut IndexPatch,
    ) {
        loop {
            let mut found: Option<(CellKey, u64)> = None;
            for cell in &self.cells {
                let CellValue::Event(_) = cell.value else {
                    continue;
                };
                let Some(nc) = cell.next else {
                    continue;
                };
                let process = cell.key.process;
                if self.position_of(&process, nc).is_some() {
                    continue;
                }
                // A hole only counts inside the window: some older write
                // of the same process must already be loaded below it
                let inside = self
                    .cells
                    .iter()
                    .any(|c| c.key.process == process && c.key.logical_clock < nc);
                if !inside {
                    continue;
                }
                found = Some((cell.key, nc));
                break;
            }
            let Some((referrer, nc)) = found else {
                break;
            };

            let process = referrer.process;
            if let Ok(Some(event)) = store.get_signed_event(system, &process, nc) {
                self.merge_event(&event, content_type, patch);
            }
            if self.position_of(&process, nc).is_none() {
                // Placeholder sits just below its referrer until the real
                // event arrives
                self.insert_sorted(
                    IndexCell {
                        key: CellKey {
                            unix_milliseconds: referrer.unix_milliseconds,
                            process,
                            logical_clock: nc,
                        },
                        next: None,
                        value: CellValue::Missing,
                    },
                    patch,
                );
            }
        }
    }

    fn resolved_count(&self) -> u64 {
        self.cells
            .iter()
            .filter(|c| matches!(c.value, CellValue::Event(_)))
            .count() as u64
    }
}

type Key = (System, ContentType);

/// Subscriber handle: pull more of the timeline with `advance`, detach
/// with `unsubscribe`.
pub struct IndexHandle {
    query: Weak<QueryIndex>,
    system: System,
    content_type: ContentType,
    callback: Callback<IndexPatch>,
}

impl IndexHandle {
    pub fn advance(&self, count: u64) {
        if let Some(query) = self.query.upgrade() {
            query.advance(self.system, self.content_type, count);
        }
    }

    pub fn unsubscribe(self) {
        if let Some(query) = self.query.upgrade() {
            query.unregister((self.system, self.content_type), &self.callback);
        }
    }
}

impl Clone for IndexHandle {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            system: self.system,
            content_type: self.content_type,
            callback: self.callback.clone(),
        }
    }
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("system", &self.system)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

pub struct QueryIndex {
    store: Arc<dyn StateLayer>,
    client: Arc<dyn ApiClient>,
    servers: Weak<dyn ServerSource>,
    sink: Weak<dyn BatchSink>,
    state: Mutex<HashMap<Key, IndexState>>,
}

impl QueryIndex {
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

    /// Register `callback` for a system's timeline of one content type.
    /// The current window is delivered synchronously as one patch; call
    /// `advance` on the returned handle to load items.
    pub fn query(
        self: &Arc<Self>,
        system: System,
        content_type: ContentType,
        callback: Callback<IndexPatch>,
    ) -> IndexHandle {
        let initial = {
            let mut state = self.state.lock().unwrap();
            let st = state.entry((system, content_type)).or_default();
            st.callbacks.add(&callback);
            if st.cells.is_empty() {
                None
            } else {
                Some(IndexPatch {
                    added: st.cells.clone(),
                    removed: Vec::new(),
                })
            }
        };
        if let Some(patch) = initial {
            callback(&patch);
        }
        IndexHandle {
            query: Arc::downgrade(self),
            system,
            content_type,
            callback,
        }
    }

    /// Ask for `count` more resolved cells, loading from every
    /// non-exhausted source as needed.
    pub fn advance(self: &Arc<Self>, system: System, content_type: ContentType, count: u64) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&(system, content_type)) else {
                return;
            };
            st.requested = st.requested.saturating_add(count);
        }
        self.fill(system, content_type);
    }

    /// Start loads from whichever sources can still contribute, until
    /// the window holds as many resolved cells as were requested.
    fn fill(self: &Arc<Self>, system: System, content_type: ContentType) {
        let servers = match self.servers.upgrade() {
            Some(source) => source.servers(&system),
            None => Vec::new(),
        };
        let mut sources = vec![Source::Disk];
        sources.extend(servers.into_iter().map(Source::Server));

        let mut to_load: Vec<(Source, Option<u64>, u64)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&(system, content_type)) else {
                return;
            };
            let have = st.resolved_count();
            if have >= st.requested {
                return;
            }
            let need = st.requested - have;
            for source in sources {
                if st.exhausted.contains(&source) || st.loading.contains(&source) {
                    continue;
                }
                st.loading.insert(source.clone());
                let cursor = st.cursors.get(&source).copied();
                to_load.push((source, cursor, need));
            }
        }

        for (source, cursor, limit) in to_load {
            match source {
                Source::Disk => self.spawn_disk_page(system, content_type, cursor, limit),
                Source::Server(server) => {
                    self.spawn_server_page(system, content_type, server, cursor, limit)
                }
                Source::Unknown => {}
            }
        }
    }

    fn spawn_disk_page(
        self: &Arc<Self>,
        system: System,
        content_type: ContentType,
        cursor: Option<u64>,
        limit: u64,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let events = match this
                .store
                .query_by_time_descending(&system, content_type, cursor, limit)
            {
                Ok(events) => events,
                Err(err) => {
                    warn!(system = %system, content_type, error = %err, "index disk page failed");
                    Vec::new()
                }
            };
            // Shorter page than asked means the store has no older items
            let ended = (events.len() as u64) < limit;
            let next_cursor = events
                .iter()
                .filter_map(|e| slot_info(e, content_type))
                .map(|(key, _)| key.unix_milliseconds)
                .min();
            this.apply_page(
                system,
                content_type,
                Source::Disk,
                &events,
                next_cursor,
                ended,
            );
        });
    }

    fn spawn_server_page(
        self: &Arc<Self>,
        system: System,
        content_type: ContentType,
        server: String,
        cursor: Option<u64>,
        limit: u64,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            match this
                .client
                .get_query_index(&server, &system, content_type, cursor, limit)
                .await
            {
                Ok(page) => {
                    let ended = page.cursor.is_none();
                    this.apply_page(
                        system,
                        content_type,
                        Source::Server(server),
                        &page.events,
                        page.cursor,
                        ended,
                    );
                    deliver_to(&this.sink, &page.events);
                    deliver_to(&this.sink, &page.proof);
                }
                Err(err) => {
                    warn!(server = %server, system = %system, content_type, error = %err,
                        "index page fetch failed");
                    this.finish_load(system, content_type, Source::Server(server));
                }
            }
        });
    }

    /// A page arrived: validate, merge, walk for gaps, emit one patch,
    /// then keep filling if still short.
    fn apply_page(
        self: &Arc<Self>,
        system: System,
        content_type: ContentType,
        source: Source,
        events: &[SignedEvent],
        next_cursor: Option<u64>,
        ended: bool,
    ) {
        if !valid_page(events, content_type) {
            warn!(system = %system, content_type, ?source, "malformed index page; dropping batch");
            // The batch is dropped but the source is not written off; a
            // later advance may retry it from the same cursor
            let mut state = self.state.lock().unwrap();
            if let Some(st) = state.get_mut(&(system, content_type)) {
                st.loading.remove(&source);
            }
            return;
        }

        let emission = {
            let mut state = self.state.lock().unwrap();
            let Some(st) = state.get_mut(&(system, content_type)) else {
                return;
            };
            st.loading.remove(&source);
            if ended {
                st.exhausted.insert(source.clone());
            } else if let Some(cursor) = next_cursor {
                st.cursors.insert(source.clone(), cursor);
            }

            let mut patch = IndexPatch::default();
            for event in events {
                st.merge_event(event, content_type, &mut patch);
            }
            st.fill_gaps(self.store.as_ref(), &system, content_type, &mut patch);
            if patch.is_empty() {
                None
            } else {
                Some((patch, st.callbacks.snapshot()))
            }
        };

        if let Some((patch, callbacks)) = emission {
            for callback in callbacks {
                callback(&patch);
            }
        }
        self.fill(system, content_type);
    }

    fn finish_load(&self, system: System, content_type: ContentType, source: Source) {
        let mut state = self.state.lock().unwrap();
        if let Some(st) = state.get_mut(&(system, content_type)) {
            st.loading.remove(&source);
            // A failed source is not retried until the next advance
        }
    }

    /// Idempotent push of a newly-observed event into any timeline it
    /// belongs to (its own type, or the deleted slot's type for a
    /// tombstone).
    pub fn update(&self, event: &SignedEvent) {
        let ev = event.event();
        let mut types = vec![ev.content_type];
        if ev.content_type == content::DELETE {
            if let Ok(Some(delete)) = ev.delete_payload() {
                types.push(delete.content_type);
            }
        }

        for content_type in types {
            let emission = {
                let mut state = self.state.lock().unwrap();
                let Some(st) = state.get_mut(&(ev.system, content_type)) else {
                    continue;
                };
                let mut patch = IndexPatch::default();
                st.merge_event(event, content_type, &mut patch);
                st.fill_gaps(self.store.as_ref(), &ev.system, content_type, &mut patch);
                if patch.is_empty() {
                    None
                } else {
                    Some((patch, st.callbacks.snapshot()))
                }
            };
            if let Some((patch, callbacks)) = emission {
                for callback in callbacks {
                    callback(&patch);
                }
            }
        }
    }

    fn unregister(&self, key: Key, callback: &Callback<IndexPatch>) {
        let mut state = self.state.lock().unwrap();
        if let Some(st) = state.get_mut(&key) {
            st.callbacks.remove(callback);
            if st.callbacks.is_empty() {
                state.remove(&key);
            }
        }
    }

    /// No timeline state remains.
    pub fn clean(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }
}

/// A page must be homogeneous in type and descending by time.
fn valid_page(events: &[SignedEvent], content_type: ContentType) -> bool {
    let mut last_time: Option<u64> = None;
    for event in events {
        let Some((key, _)) = slot_info(event, content_type) else {
            return false;
        };
        if let Some(last) = last_time {
            if key.unix_milliseconds > last {
                return false;
            }
        }
        last_time = Some(key.unix_milliseconds);
    }
    true
}

impl std::fmt::Debug for QueryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryIndex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stele_model::{Keypair, MockClock, ProcessHandle};
    use stele_store::MemoryStore;

    fn posts(n: u64) -> (ProcessHandle, Vec<SignedEvent>) {
        let clock = Arc::new(MockClock::new(0));
        let mut h = ProcessHandle::with_clock(Keypair::generate(), clock.clone());
        let mut events = Vec::new();
        for i in 1..=n {
            clock.set(i * 10);
            events.push(h.post(&format!("post {}", i)));
        }
        (h, events)
    }

    #[test]
    fn test_slot_info_of_tombstone_stand_in() {
        let (mut h, events) = posts(2);
        let tomb = h.delete(&events[1]);

        let (key, next) = slot_info(&tomb, content::POST).unwrap();
        assert_eq!(key.process, h.process());
        assert_eq!(key.logical_clock, 2);
        assert_eq!(key.unix_milliseconds, events[1].event().unix_milliseconds);
        assert_eq!(next, Some(1));

        // The tombstone belongs to no other timeline
        assert!(slot_info(&tomb, content::USERNAME).is_none());
        assert!(slot_info(&events[0], content::USERNAME).is_none());
    }

    #[test]
    fn test_valid_page_rejects_ascending_and_foreign_types() {
        let (_, events) = posts(3);
        let desc: Vec<SignedEvent> = events.iter().rev().cloned().collect();
        assert!(valid_page(&desc, content::POST));
        assert!(!valid_page(&events, content::POST));
        assert!(!valid_page(&desc, content::USERNAME));
    }

    #[test]
    fn test_gap_yields_placeholder_then_resolves() {
        let (h, events) = posts(3);
        let store = MemoryStore::new();
        let mut st = IndexState::default();
        let mut patch = IndexPatch::default();

        st.merge_event(&events[0], content::POST, &mut patch);
        st.merge_event(&events[2], content::POST, &mut patch);
        st.fill_gaps(&store, &h.system(), content::POST, &mut patch);

        let clocks: Vec<u64> = st.cells.iter().map(|c| c.key.logical_clock).collect();
        assert_eq!(clocks, vec![3, 2, 1]);
        assert_eq!(st.cells[1].value, CellValue::Missing);

        let mut patch = IndexPatch::default();
        st.merge_event(&events[1], content::POST, &mut patch);
        assert_eq!(patch.removed.len(), 1);
        assert_eq!(patch.removed[0].value, CellValue::Missing);
        assert!(st
            .cells
            .iter()
            .all(|c| matches!(c.value, CellValue::Event(_))));
        let clocks: Vec<u64> = st.cells.iter().map(|c| c.key.logical_clock).collect();
        assert_eq!(clocks, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_malformed_page_drops_batch_but_keeps_source() {
        let (h, events) = posts(3);
        let store = Arc::new(MemoryStore::new());
        let sim = Arc::new(stele_net::SimServer::new());
        let manager = crate::manager::QueryManager::new(store, sim);
        let index = manager.query_index.clone();

        let cb: Callback<IndexPatch> = Arc::new(|_| {});
        let handle = index.query(h.system(), content::POST, cb);

        let source = Source::Server("alpha".to_string());
        {
            let mut state = index.state.lock().unwrap();
            let st = state.get_mut(&(h.system(), content::POST)).unwrap();
            st.loading.insert(source.clone());
        }
        // Ascending order fails page validation
        index.apply_page(h.system(), content::POST, source.clone(), &events, None, false);

        let state = index.state.lock().unwrap();
        let st = state.get(&(h.system(), content::POST)).unwrap();
        assert!(st.cells.is_empty(), "malformed batch must not merge");
        assert!(
            !st.exhausted.contains(&source),
            "a later advance may retry the source"
        );
        assert!(!st.loading.contains(&source));
        drop(state);
        handle.unsubscribe();
    }

    #[test]
    fn test_gap_lookup_prefers_store_over_placeholder() {
        let (h, events) = posts(3);
        let store = MemoryStore::new();
        store.ingest(&events[1]).unwrap();
        let mut st = IndexState::default();
        let mut patch = IndexPatch::default();

        st.merge_event(&events[0], content::POST, &mut patch);
        st.merge_event(&events[2], content::POST, &mut patch);
        st.fill_gaps(&store, &h.system(), content::POST, &mut patch);

        assert!(st
            .cells
            .iter()
            .all(|c| matches!(c.value, CellValue::Event(_))));
        assert_eq!(st.cells[1].key.logical_clock, 2);
    }
}
