//! DiskStore - redb-backed StateLayer
//!
//! Tables:
//! - events:   [system|process|clock]                   -> signed event bytes
//! - heads:    [system|process]                         -> highest clock
//! - time_idx: [system|type|time|process|clock]         -> events key
//! - crdt:     [system|type]                            -> winning register write
//! - crdt_set: [system|type|value]                      -> winning set operation

use std::path::Path;

use prost::Message;
use redb::{Database, ReadableTable, TableDefinition};
use stele_model::{content, ContentType, Process, SetOperation, SignedEvent, System};

use crate::{
    CrdtItem, CrdtSetItem, IngestOutcome, ProcessState, StateLayer, StoreError, SystemState,
};

const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");
const HEADS: TableDefinition<&[u8], u64> = TableDefinition::new("heads");
const TIME_IDX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("time_idx");
const CRDT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("crdt");
const CRDT_SET: TableDefinition<&[u8], &[u8]> = TableDefinition::new("crdt_set");

/// Stored winning LWW register write.
#[derive(Clone, PartialEq, ::prost::Message)]
struct StoredCrdtItem {
    #[prost(bytes = "vec", tag = "1")]
    value: Vec<u8>,
    #[prost(uint64, tag = "2")]
    unix_milliseconds: u64,
    #[prost(bytes = "vec", tag = "3")]
    process: Vec<u8>,
}

/// Stored winning LWW element-set operation.
#[derive(Clone, PartialEq, ::prost::Message)]
struct StoredCrdtSetItem {
    #[prost(uint64, tag = "1")]
    unix_milliseconds: u64,
    #[prost(bytes = "vec", tag = "2")]
    process: Vec<u8>,
    #[prost(bool, tag = "3")]
    is_remove: bool,
}

fn event_key(system: &System, process: &Process, logical_clock: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(56);
    key.extend_from_slice(system.as_bytes());
    key.extend_from_slice(process.as_bytes());
    key.extend_from_slice(&logical_clock.to_be_bytes());
    key
}

fn head_key(system: &System, process: &Process) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(system.as_bytes());
    key.extend_from_slice(process.as_bytes());
    key
}

fn time_key(
    system: &System,
    content_type: ContentType,
    unix_milliseconds: u64,
    process: &Process,
    logical_clock: u64,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(72);
    key.extend_from_slice(system.as_bytes());
    key.extend_from_slice(&content_type.to_be_bytes());
    key.extend_from_slice(&unix_milliseconds.to_be_bytes());
    key.extend_from_slice(process.as_bytes());
    key.extend_from_slice(&logical_clock.to_be_bytes());
    key
}

fn crdt_key(system: &System, content_type: ContentType) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(system.as_bytes());
    key.extend_from_slice(&content_type.to_be_bytes());
    key
}

fn crdt_set_key(system: &System, content_type: ContentType, value: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(40 + value.len());
    key.extend_from_slice(system.as_bytes());
    key.extend_from_slice(&content_type.to_be_bytes());
    key.extend_from_slice(value);
    key
}

/// Persistent store on redb.
pub struct DiskStore {
    db: Database,
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore").finish_non_exhaustive()
    }
}

impl DiskStore {
    /// Open or create a DiskStore in the given directory.
    /// Creates the directory (if needed) and `events.db` inside.
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = state_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("events.db"))?;

        // Create all tables up front so reads never hit a missing table
        let txn = db.begin_write()?;
        {
            txn.open_table(EVENTS)?;
            txn.open_table(HEADS)?;
            txn.open_table(TIME_IDX)?;
            txn.open_table(CRDT)?;
            txn.open_table(CRDT_SET)?;
        }
        txn.commit()?;

        Ok(Self { db })
    }

    fn load_event(
        events: &impl ReadableTable<&'static [u8], &'static [u8]>,
        key: &[u8],
    ) -> Result<Option<SignedEvent>, StoreError> {
        match events.get(key)? {
            Some(bytes) => Ok(Some(SignedEvent::decode(bytes.value())?)),
            None => Ok(None),
        }
    }
}

impl StateLayer for DiskStore {
    fn get_signed_event(
        &self,
        system: &System,
        process: &Process,
        logical_clock: u64,
    ) -> Result<Option<SignedEvent>, StoreError> {
        let txn = self.db.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        Self::load_event(&events, &event_key(system, process, logical_clock))
    }

    fn get_latest(
        &self,
        system: &System,
        content_type: ContentType,
    ) -> Result<Option<SignedEvent>, StoreError> {
        let txn = self.db.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        let time_idx = txn.open_table(TIME_IDX)?;

        let low = time_key(system, content_type, 0, &Process::from([0u8; 16]), 0);
        let high = time_key(
            system,
            content_type,
            u64::MAX,
            &Process::from([0xFFu8; 16]),
            u64::MAX,
        );
        for entry in time_idx.range(low.as_slice()..=high.as_slice())?.rev() {
            let (_, slot_key) = entry?;
            let event = Self::load_event(&events, slot_key.value())?
                .ok_or_else(|| StoreError::Corrupt("time index points at missing event".into()))?;
            // Skip tombstone stand-ins
            if event.event().content_type == content_type {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn query_system_state(&self, system: &System) -> Result<SystemState, StoreError> {
        let txn = self.db.begin_read()?;
        let mut state = SystemState::default();

        let heads = txn.open_table(HEADS)?;
        let low = head_key(system, &Process::from([0u8; 16]));
        let high = head_key(system, &Process::from([0xFFu8; 16]));
        for entry in heads.range(low.as_slice()..=high.as_slice())? {
            let (key, head_clock) = entry?;
            let process = Process::try_from(&key.value()[32..48])
                .map_err(|_| StoreError::Corrupt("bad head key".into()))?;
            state.processes.push(ProcessState {
                process,
                head_clock: head_clock.value(),
            });
        }

        let crdt = txn.open_table(CRDT)?;
        let low = crdt_key(system, 0);
        let high = crdt_key(system, u64::MAX);
        for entry in crdt.range(low.as_slice()..=high.as_slice())? {
            let (key, stored) = entry?;
            let content_type = u64::from_be_bytes(
                key.value()[32..40]
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("bad crdt key".into()))?,
            );
            let item = StoredCrdtItem::decode(stored.value())?;
            state.crdt_items.push(CrdtItem {
                content_type,
                value: item.value,
                unix_milliseconds: item.unix_milliseconds,
            });
        }

        let crdt_set = txn.open_table(CRDT_SET)?;
        for entry in crdt_set.range(system.as_bytes().as_slice()..)? {
            let (key, stored) = entry?;
            if !key.value().starts_with(system.as_bytes()) {
                break;
            }
            let content_type = u64::from_be_bytes(
                key.value()[32..40]
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("bad crdt_set key".into()))?,
            );
            let value = key.value()[40..].to_vec();
            let item = StoredCrdtSetItem::decode(stored.value())?;
            state.crdt_set_items.push(CrdtSetItem {
                content_type,
                value,
                operation: if item.is_remove {
                    SetOperation::Remove
                } else {
                    SetOperation::Add
                },
                unix_milliseconds: item.unix_milliseconds,
            });
        }

        Ok(state)
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
        let txn = self.db.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        let time_idx = txn.open_table(TIME_IDX)?;

        let low = time_key(system, content_type, 0, &Process::from([0u8; 16]), 0);
        let high = time_key(
            system,
            content_type,
            upper_time,
            &Process::from([0xFFu8; 16]),
            u64::MAX,
        );
        let mut out = Vec::new();
        for entry in time_idx.range(low.as_slice()..=high.as_slice())?.rev() {
            if out.len() as u64 >= limit {
                break;
            }
            let (_, slot_key) = entry?;
            let event = Self::load_event(&events, slot_key.value())?
                .ok_or_else(|| StoreError::Corrupt("time index points at missing event".into()))?;
            out.push(event);
        }
        Ok(out)
    }

    fn ingest(&self, signed_event: &SignedEvent) -> Result<IngestOutcome, StoreError> {
        let ev = signed_event.event();
        let own_key = event_key(&ev.system, &ev.process, ev.logical_clock);
        let delete = ev.delete_payload()?;
        let encoded = signed_event.encode_to_vec();

        let txn = self.db.begin_write()?;
        let outcome = {
            let mut events = txn.open_table(EVENTS)?;
            let mut heads = txn.open_table(HEADS)?;
            let mut time_idx = txn.open_table(TIME_IDX)?;
            let mut crdt = txn.open_table(CRDT)?;
            let mut crdt_set = txn.open_table(CRDT_SET)?;

            if events.get(own_key.as_slice())?.is_some() {
                IngestOutcome::Duplicate
            } else {
                if let Some(payload) = &delete {
                    let target_key =
                        event_key(&ev.system, &payload.process, payload.logical_clock);
                    let target_is_delete = match events.get(target_key.as_slice())? {
                        Some(existing) => {
                            SignedEvent::decode(existing.value())?.event().content_type
                                == content::DELETE
                        }
                        None => false,
                    };
                    if target_is_delete {
                        return Err(StoreError::InvalidDelete);
                    }
                    // Re-point the tombstoned slot at the delete event and
                    // keep its time index position walkable
                    events.insert(target_key.as_slice(), encoded.as_slice())?;
                    time_idx.insert(
                        time_key(
                            &ev.system,
                            payload.content_type,
                            payload.unix_milliseconds,
                            &payload.process,
                            payload.logical_clock,
                        )
                        .as_slice(),
                        target_key.as_slice(),
                    )?;
                }

                events.insert(own_key.as_slice(), encoded.as_slice())?;

                let hkey = head_key(&ev.system, &ev.process);
                let prior = heads.get(hkey.as_slice())?.map(|g| g.value()).unwrap_or(0);
                if ev.logical_clock > prior {
                    heads.insert(hkey.as_slice(), ev.logical_clock)?;
                }

                time_idx.insert(
                    time_key(
                        &ev.system,
                        ev.content_type,
                        ev.unix_milliseconds,
                        &ev.process,
                        ev.logical_clock,
                    )
                    .as_slice(),
                    own_key.as_slice(),
                )?;

                if let Some(element) = &ev.lww_element {
                    let ckey = crdt_key(&ev.system, ev.content_type);
                    let newer = match crdt.get(ckey.as_slice())? {
                        Some(existing) => {
                            let item = StoredCrdtItem::decode(existing.value())?;
                            (element.unix_milliseconds, ev.process.as_bytes().as_slice())
                                > (item.unix_milliseconds, item.process.as_slice())
                        }
                        None => true,
                    };
                    if newer {
                        let stored = StoredCrdtItem {
                            value: element.value.clone(),
                            unix_milliseconds: element.unix_milliseconds,
                            process: ev.process.as_bytes().to_vec(),
                        };
                        crdt.insert(ckey.as_slice(), stored.encode_to_vec().as_slice())?;
                    }
                }

                if let Some(element) = &ev.lww_element_set {
                    let skey = crdt_set_key(&ev.system, ev.content_type, &element.value);
                    let newer = match crdt_set.get(skey.as_slice())? {
                        Some(existing) => {
                            let item = StoredCrdtSetItem::decode(existing.value())?;
                            (element.unix_milliseconds, ev.process.as_bytes().as_slice())
                                > (item.unix_milliseconds, item.process.as_slice())
                        }
                        None => true,
                    };
                    if newer {
                        let stored = StoredCrdtSetItem {
                            unix_milliseconds: element.unix_milliseconds,
                            process: ev.process.as_bytes().to_vec(),
                            is_remove: element.operation == SetOperation::Remove,
                        };
                        crdt_set.insert(skey.as_slice(), stored.encode_to_vec().as_slice())?;
                    }
                }

                IngestOutcome::Applied
            }
        };
        txn.commit()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stele_model::{content, Keypair, MockClock, ProcessHandle};

    fn open_store() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_round_trip_and_idempotency() {
        let (_dir, store) = open_store();
        let clock = Arc::new(MockClock::new(50));
        let mut h = ProcessHandle::with_clock(Keypair::generate(), clock.clone());
        let post = h.post("hello");

        assert_eq!(store.ingest(&post).unwrap(), IngestOutcome::Applied);
        assert_eq!(store.ingest(&post).unwrap(), IngestOutcome::Duplicate);

        let loaded = store
            .get_signed_event(&h.system(), &h.process(), 1)
            .unwrap()
            .unwrap();
        assert_eq!(loaded, post);
    }

    #[test]
    fn test_time_descending_and_heads() {
        let (_dir, store) = open_store();
        let clock = Arc::new(MockClock::new(10));
        let mut h = ProcessHandle::with_clock(Keypair::generate(), clock.clone());
        for i in 0..3 {
            clock.set(10 + i);
            store.ingest(&h.post(&format!("{}", i))).unwrap();
        }

        let page = store
            .query_by_time_descending(&h.system(), content::POST, None, 2)
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].event().logical_clock, 3);
        assert_eq!(page[1].event().logical_clock, 2);

        let state = store.query_system_state(&h.system()).unwrap();
        assert_eq!(state.processes.len(), 1);
        assert_eq!(state.processes[0].head_clock, 3);
    }

    #[test]
    fn test_delete_tombstone_persisted() {
        let (_dir, store) = open_store();
        let clock = Arc::new(MockClock::new(10));
        let mut h = ProcessHandle::with_clock(Keypair::generate(), clock.clone());
        let post = h.post("doomed");
        store.ingest(&post).unwrap();
        clock.set(20);
        let tombstone = h.delete(&post);
        store.ingest(&tombstone).unwrap();

        let slot = store
            .get_signed_event(&h.system(), &h.process(), 1)
            .unwrap()
            .unwrap();
        assert_eq!(slot, tombstone);

        let second = h.delete(&post);
        assert!(matches!(
            store.ingest(&second),
            Err(StoreError::InvalidDelete)
        ));
    }

    #[test]
    fn test_crdt_register_materialized() {
        let (_dir, store) = open_store();
        let clock = Arc::new(MockClock::new(10));
        let mut h = ProcessHandle::with_clock(Keypair::generate(), clock.clone());
        store
            .ingest(&h.set_crdt_item(content::USERNAME, b"alice".to_vec()))
            .unwrap();
        clock.set(20);
        store
            .ingest(&h.set_crdt_item(content::USERNAME, b"bob".to_vec()))
            .unwrap();

        let state = store.query_system_state(&h.system()).unwrap();
        let item = state
            .crdt_items
            .iter()
            .find(|i| i.content_type == content::USERNAME)
            .unwrap();
        assert_eq!(item.value, b"bob");
        assert_eq!(item.unix_milliseconds, 20);
    }
}
