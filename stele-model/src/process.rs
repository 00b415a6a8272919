//! ProcessHandle - authoring helper for one device's log
//!
//! Owns the keypair, process id, logical clock, and the running per-type
//! skip-chain indices, and produces correctly chained signed events.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::content::{self, ContentType};
use crate::event::{
    Delete, Event, Indices, Keypair, LwwElement, LwwElementSet, Pointer, SetOperation,
    SignedEvent, VectorClock,
};
use crate::types::{Process, System};

/// One device/writer of a system. Logical clock starts at 1 and strictly
/// increases; `indices` always points at the previous write of each type.
pub struct ProcessHandle {
    keypair: Keypair,
    process: Process,
    logical_clock: u64,
    indices: BTreeMap<ContentType, u64>,
    clock: Arc<dyn Clock>,
}

impl ProcessHandle {
    pub fn new(keypair: Keypair) -> Self {
        Self::with_clock(keypair, Arc::new(SystemClock))
    }

    pub fn with_clock(keypair: Keypair, clock: Arc<dyn Clock>) -> Self {
        Self {
            keypair,
            process: Process::random(),
            logical_clock: 0,
            indices: BTreeMap::new(),
            clock,
        }
    }

    pub fn system(&self) -> System {
        self.keypair.system()
    }

    pub fn process(&self) -> Process {
        self.process
    }

    /// Author and sign the next event in this process's log.
    pub fn next(
        &mut self,
        content_type: ContentType,
        content: Vec<u8>,
        lww_element: Option<LwwElement>,
        lww_element_set: Option<LwwElementSet>,
        references: Vec<Pointer>,
    ) -> SignedEvent {
        self.logical_clock += 1;
        let event = Event {
            system: self.keypair.system(),
            process: self.process,
            logical_clock: self.logical_clock,
            content_type,
            content,
            lww_element,
            lww_element_set,
            references,
            indices: self.indices.iter().map(|(t, c)| (*t, *c)).collect::<Indices>(),
            vector_clock: VectorClock::default(),
            unix_milliseconds: self.clock.now_ms(),
        };
        self.indices.insert(content_type, self.logical_clock);
        event.sign(&self.keypair)
    }

    /// Author a plain text post.
    pub fn post(&mut self, text: &str) -> SignedEvent {
        self.next(content::POST, text.as_bytes().to_vec(), None, None, Vec::new())
    }

    /// Author an LWW register write (username, description, ...).
    pub fn set_crdt_item(&mut self, content_type: ContentType, value: Vec<u8>) -> SignedEvent {
        let element = LwwElement {
            value,
            unix_milliseconds: self.clock.now_ms(),
        };
        self.next(content_type, Vec::new(), Some(element), None, Vec::new())
    }

    /// Author an LWW element-set operation (follow, server, ...).
    pub fn crdt_set_op(
        &mut self,
        content_type: ContentType,
        operation: SetOperation,
        value: Vec<u8>,
    ) -> SignedEvent {
        let element = LwwElementSet {
            operation,
            value,
            unix_milliseconds: self.clock.now_ms(),
        };
        self.next(content_type, Vec::new(), None, Some(element), Vec::new())
    }

    /// Author a tombstone for one of this system's events.
    ///
    /// Panics if `deleted` belongs to another system or is itself a delete
    /// event; both indicate a caller bug.
    pub fn delete(&mut self, deleted: &SignedEvent) -> SignedEvent {
        let target = deleted.event();
        assert_eq!(
            target.system,
            self.keypair.system(),
            "cannot delete another system's event"
        );
        assert_ne!(
            target.content_type,
            content::DELETE,
            "cannot delete a delete event"
        );
        let payload = Delete {
            process: target.process,
            logical_clock: target.logical_clock,
            content_type: target.content_type,
            indices: target.indices.clone(),
            unix_milliseconds: target.unix_milliseconds,
        };
        self.next(
            content::DELETE,
            payload.encode_to_vec(),
            None,
            None,
            vec![deleted.pointer()],
        )
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("system", &self.system())
            .field("process", &self.process)
            .field("logical_clock", &self.logical_clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn handle() -> ProcessHandle {
        ProcessHandle::with_clock(Keypair::generate(), Arc::new(MockClock::new(1000)))
    }

    #[test]
    fn test_logical_clock_strictly_increases() {
        let mut h = handle();
        let a = h.post("one");
        let b = h.post("two");
        assert_eq!(a.event().logical_clock, 1);
        assert_eq!(b.event().logical_clock, 2);
    }

    #[test]
    fn test_indices_point_at_previous_write_of_type() {
        let mut h = handle();
        let a = h.post("one");
        let b = h.set_crdt_item(content::USERNAME, b"alice".to_vec());
        let c = h.post("two");

        assert_eq!(a.event().indices.get(content::POST), None);
        assert_eq!(b.event().indices.get(content::POST), Some(1));
        assert_eq!(c.event().indices.get(content::POST), Some(1));
        assert_eq!(c.event().indices.get(content::USERNAME), Some(2));
    }

    #[test]
    fn test_delete_copies_target_metadata() {
        let mut h = handle();
        let post = h.post("one");
        let tombstone = h.delete(&post);

        let payload = tombstone.event().delete_payload().unwrap().unwrap();
        assert_eq!(payload.process, post.event().process);
        assert_eq!(payload.logical_clock, post.event().logical_clock);
        assert_eq!(payload.content_type, content::POST);
        assert_eq!(payload.unix_milliseconds, post.event().unix_milliseconds);
    }

    #[test]
    #[should_panic(expected = "cannot delete a delete event")]
    fn test_delete_of_delete_panics() {
        let mut h = handle();
        let post = h.post("one");
        let tombstone = h.delete(&post);
        h.delete(&tombstone);
    }
}
