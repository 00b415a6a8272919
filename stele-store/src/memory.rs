//! MemoryStore - BTreeMap-backed StateLayer for tests and ephemeral sessions

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use stele_model::{content, ContentType, Process, SetOperation, SignedEvent, System};

use crate::{
    CrdtItem, CrdtSetItem, IngestOutcome, ProcessState, StateLayer, StoreError, SystemState,
};

const PROCESS_MIN: [u8; 16] = [0u8; 16];
const PROCESS_MAX: [u8; 16] = [0xFF; 16];

#[derive(Default)]
struct Inner {
    /// (system, process, logical_clock) -> event (or its tombstone stand-in)
    events: BTreeMap<(System, Process, u64), SignedEvent>,
    /// (system, process) -> highest stored logical clock
    heads: BTreeMap<(System, Process), u64>,
    /// (system, content_type, unix_milliseconds, process, logical_clock)
    time_index: BTreeSet<(System, ContentType, u64, Process, u64)>,
    /// (system, content_type) -> winning LWW register write
    crdt: BTreeMap<(System, ContentType), (u64, Process, Vec<u8>)>,
    /// (system, content_type, element value) -> winning set operation
    crdt_set: BTreeMap<(System, ContentType, Vec<u8>), (u64, Process, SetOperation)>,
}

/// In-memory store, fully `StateLayer`-conformant. The standard fixture
/// for engine tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored slots, tombstones included.
    pub fn event_count(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }
}

impl Inner {
    fn apply_indexes(&mut self, signed: &SignedEvent) {
        let ev = signed.event();
        let head = self.heads.entry((ev.system, ev.process)).or_insert(0);
        if ev.logical_clock > *head {
            *head = ev.logical_clock;
        }
        self.time_index.insert((
            ev.system,
            ev.content_type,
            ev.unix_milliseconds,
            ev.process,
            ev.logical_clock,
        ));
        if let Some(element) = &ev.lww_element {
            let key = (ev.system, ev.content_type);
            match self.crdt.get(&key) {
                Some(existing) if (existing.0, existing.1) >= (element.unix_milliseconds, ev.process) => {}
                _ => {
                    self.crdt
                        .insert(key, (element.unix_milliseconds, ev.process, element.value.clone()));
                }
            }
        }
        if let Some(element) = &ev.lww_element_set {
            let key = (ev.system, ev.content_type, element.value.clone());
            match self.crdt_set.get(&key) {
                Some(existing) if (existing.0, existing.1) >= (element.unix_milliseconds, ev.process) => {}
                _ => {
                    self.crdt_set
                        .insert(key, (element.unix_milliseconds, ev.process, element.operation));
                }
            }
        }
    }
}

impl StateLayer for MemoryStore {
    fn get_signed_event(
        &self,
        system: &System,
        process: &Process,
        logical_clock: u64,
    ) -> Result<Option<SignedEvent>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.events.get(&(*system, *process, logical_clock)).cloned())
    }

    fn get_latest(
        &self,
        system: &System,
        content_type: ContentType,
    ) -> Result<Option<SignedEvent>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let low = (*system, content_type, 0, Process::from(PROCESS_MIN), 0);
        let high = (
            *system,
            content_type,
            u64::MAX,
            Process::from(PROCESS_MAX),
            u64::MAX,
        );
        for (_, _, _, process, logical_clock) in inner.time_index.range(low..=high).rev() {
            let event = inner
                .events
                .get(&(*system, *process, *logical_clock))
                .ok_or_else(|| StoreError::Corrupt("time index points at missing event".into()))?;
            // Skip tombstone stand-ins
            if event.event().content_type == content_type {
                return Ok(Some(event.clone()));
            }
        }
        Ok(None)
    }

    fn query_system_state(&self, system: &System) -> Result<SystemState, StoreError> {
        let inner = self.inner.lock().unwrap();
        let processes = inner
            .heads
            .range((*system, Process::from(PROCESS_MIN))..=(*system, Process::from(PROCESS_MAX)))
            .map(|((_, process), head_clock)| ProcessState {
                process: *process,
                head_clock: *head_clock,
            })
            .collect();
        let crdt_items = inner
            .crdt
            .range((*system, 0)..=(*system, u64::MAX))
            .map(|((_, content_type), (unix_milliseconds, _, value))| CrdtItem {
                content_type: *content_type,
                value: value.clone(),
                unix_milliseconds: *unix_milliseconds,
            })
            .collect();
        let crdt_set_items = inner
            .crdt_set
            .range((*system, 0, Vec::new())..)
            .take_while(|((s, _, _), _)| s == system)
            .map(
                |((_, content_type, value), (unix_milliseconds, _, operation))| CrdtSetItem {
                    content_type: *content_type,
                    value: value.clone(),
                    operation: *operation,
                    unix_milliseconds: *unix_milliseconds,
                },
            )
            .collect();
        Ok(SystemState {
            processes,
            crdt_items,
            crdt_set_items,
        })
    }

    fn query_by_time_descending(
        &self,
        system: &System,
        content_type: ContentType,
        cursor: Option<u64>,
        limit: u64,
    ) -> Result<Vec<SignedEvent>, StoreError> {
        let upper_time = match cursor {
            Some(0) => return Ok(Vec::new()),
            Some(t) => t - 1,
            None => u64::MAX,
        };
        let inner = self.inner.lock().unwrap();
        let low = (*system, content_type, 0, Process::from(PROCESS_MIN), 0);
        let high = (
            *system,
            content_type,
            upper_time,
            Process::from(PROCESS_MAX),
            u64::MAX,
        );
        let mut out = Vec::new();
        for (_, _, _, process, logical_clock) in inner.time_index.range(low..=high).rev() {
            if out.len() as u64 >= limit {
                break;
            }
            let event = inner
                .events
                .get(&(*system, *process, *logical_clock))
                .ok_or_else(|| StoreError::Corrupt("time index points at missing event".into()))?;
            out.push(event.clone());
        }
        Ok(out)
    }

    fn ingest(&self, signed_event: &SignedEvent) -> Result<IngestOutcome, StoreError> {
        let ev = signed_event.event();
        let own_key = (ev.system, ev.process, ev.logical_clock);
        let mut inner = self.inner.lock().unwrap();

        if inner.events.contains_key(&own_key) {
            return Ok(IngestOutcome::Duplicate);
        }

        let delete = ev.delete_payload()?;
        if let Some(payload) = &delete {
            let target_key = (ev.system, payload.process, payload.logical_clock);
            if let Some(existing) = inner.events.get(&target_key) {
                if existing.event().content_type == content::DELETE {
                    return Err(StoreError::InvalidDelete);
                }
            }
            // Re-point the tombstoned slot at the delete event, keeping its
            // time index position so chains remain walkable.
            inner.events.insert(target_key, signed_event.clone());
            inner.time_index.insert((
                ev.system,
                payload.content_type,
                payload.unix_milliseconds,
                payload.process,
                payload.logical_clock,
            ));
        }

        inner.events.insert(own_key, signed_event.clone());
        inner.apply_indexes(signed_event);
        Ok(IngestOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stele_model::{content, Keypair, MockClock, ProcessHandle};

    fn handle(clock: &Arc<MockClock>) -> ProcessHandle {
        ProcessHandle::with_clock(Keypair::generate(), clock.clone())
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let store = MemoryStore::new();
        let clock = Arc::new(MockClock::new(1));
        let mut h = handle(&clock);
        let post = h.post("hi");

        assert_eq!(store.ingest(&post).unwrap(), IngestOutcome::Applied);
        assert_eq!(store.ingest(&post).unwrap(), IngestOutcome::Duplicate);
        assert_eq!(store.event_count(), 1);
    }

    #[test]
    fn test_point_lookup_round_trip() {
        let store = MemoryStore::new();
        let clock = Arc::new(MockClock::new(1));
        let mut h = handle(&clock);
        let post = h.post("hi");
        store.ingest(&post).unwrap();

        let loaded = store
            .get_signed_event(&h.system(), &h.process(), 1)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, post);
        assert!(store
            .get_signed_event(&h.system(), &h.process(), 2)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_time_descending_with_cursor() {
        let store = MemoryStore::new();
        let clock = Arc::new(MockClock::new(1));
        let mut h = handle(&clock);
        for i in 0..5 {
            clock.set(10 + i);
            store.ingest(&h.post(&format!("post {}", i))).unwrap();
        }

        let page = store
            .query_by_time_descending(&h.system(), content::POST, None, 2)
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].event().unix_milliseconds, 14);
        assert_eq!(page[1].event().unix_milliseconds, 13);

        let next = store
            .query_by_time_descending(&h.system(), content::POST, Some(13), 10)
            .unwrap();
        assert_eq!(next.len(), 3);
        assert_eq!(next[0].event().unix_milliseconds, 12);
    }

    #[test]
    fn test_delete_repoints_slot_and_keeps_index_position() {
        let store = MemoryStore::new();
        let clock = Arc::new(MockClock::new(100));
        let mut h = handle(&clock);
        let post = h.post("doomed");
        store.ingest(&post).unwrap();

        clock.set(200);
        let tombstone = h.delete(&post);
        store.ingest(&tombstone).unwrap();

        // The slot resolves to the delete event
        let slot = store
            .get_signed_event(&h.system(), &h.process(), 1)
            .unwrap()
            .unwrap();
        assert_eq!(slot, tombstone);

        // The timeline still has an entry at the deleted position
        let page = store
            .query_by_time_descending(&h.system(), content::POST, None, 10)
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0], tombstone);

        // Late arrival of the original must not clobber the tombstone
        assert_eq!(store.ingest(&post).unwrap(), IngestOutcome::Duplicate);
        let slot = store
            .get_signed_event(&h.system(), &h.process(), 1)
            .unwrap()
            .unwrap();
        assert_eq!(slot, tombstone);
    }

    #[test]
    fn test_delete_of_delete_rejected() {
        let store = MemoryStore::new();
        let clock = Arc::new(MockClock::new(100));
        let mut h = handle(&clock);
        let post = h.post("doomed");
        let tombstone = h.delete(&post);
        store.ingest(&post).unwrap();
        store.ingest(&tombstone).unwrap();

        // Forge a second delete aimed at the tombstoned slot
        let second = h.delete(&post);
        assert!(matches!(
            store.ingest(&second),
            Err(StoreError::InvalidDelete)
        ));
    }

    #[test]
    fn test_get_latest_skips_tombstones() {
        let store = MemoryStore::new();
        let clock = Arc::new(MockClock::new(10));
        let mut h = handle(&clock);
        let first = h.set_crdt_item(content::USERNAME, b"alice".to_vec());
        clock.set(20);
        let second = h.set_crdt_item(content::USERNAME, b"bob".to_vec());
        store.ingest(&first).unwrap();
        store.ingest(&second).unwrap();

        let latest = store.get_latest(&h.system(), content::USERNAME).unwrap().unwrap();
        assert_eq!(latest, second);

        clock.set(30);
        store.ingest(&h.delete(&second)).unwrap();
        let latest = store.get_latest(&h.system(), content::USERNAME).unwrap().unwrap();
        assert_eq!(latest, first);
    }

    #[test]
    fn test_system_state_tracks_heads() {
        let store = MemoryStore::new();
        let clock = Arc::new(MockClock::new(10));
        let mut h = handle(&clock);
        store.ingest(&h.post("a")).unwrap();
        store.ingest(&h.post("b")).unwrap();

        let state = store.query_system_state(&h.system()).unwrap();
        assert_eq!(state.processes.len(), 1);
        assert_eq!(state.processes[0].process, h.process());
        assert_eq!(state.processes[0].head_clock, 2);
    }
}
