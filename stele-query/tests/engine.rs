//! End-to-end engine tests over MemoryStore and SimServer.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stele_model::{
    content, Delete, Event, Indices, Keypair, MockClock, Process, ProcessHandle, SetOperation,
    SignedEvent, System, VectorClock,
};
use stele_net::SimServer;
use stele_query::{
    Callback, CancelContext, CellValue, CrdtValue, HeadSnapshot, IndexCell, IndexPatch,
    QueryManager, SetPatch,
};
use stele_store::{MemoryStore, StateLayer};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn engine() -> (Arc<QueryManager>, Arc<SimServer>, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let sim = Arc::new(SimServer::new());
    let manager = QueryManager::new(store.clone(), sim.clone());
    (manager, sim, store)
}

fn author(seed: u8, clock: &Arc<MockClock>) -> ProcessHandle {
    ProcessHandle::with_clock(Keypair::from_bytes(&[seed; 32]), clock.clone())
}

fn collector<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, Callback<T>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: Callback<T> = Arc::new(move |value: &T| {
        sink.lock().unwrap().push(value.clone());
    });
    (seen, callback)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached within timeout");
}

fn head_clock(snapshot: &HeadSnapshot, process: &Process) -> Option<u64> {
    snapshot
        .head
        .get(process)
        .map(|e| e.event().logical_clock)
}

/// Replay a patch stream into the window it describes.
fn fold_window(patches: &[IndexPatch]) -> Vec<IndexCell> {
    let mut cells: Vec<IndexCell> = Vec::new();
    for patch in patches {
        for removed in &patch.removed {
            cells.retain(|c| !(c.key == removed.key && c.value == removed.value));
        }
        cells.extend(patch.added.iter().cloned());
    }
    cells.sort_by(|a, b| b.key.cmp(&a.key));
    cells
}

fn fold_members(patches: &[SetPatch]) -> BTreeSet<Vec<u8>> {
    let mut members = BTreeSet::new();
    for patch in patches {
        for value in &patch.removed {
            members.remove(value);
        }
        for value in &patch.added {
            members.insert(value.clone());
        }
    }
    members
}

#[tokio::test]
async fn test_head_two_subscribers_and_unregister() {
    let (manager, sim, _) = engine();
    sim.add_server("alpha");
    let clock = Arc::new(MockClock::new(0));
    let mut h = author(1, &clock);
    clock.set(10);
    let e1 = h.post("one");
    sim.add_events("alpha", &[e1.clone()]);
    manager.add_address_hint(h.system(), "alpha");
    let process = h.process();

    let (seen_a, cb_a) = collector::<HeadSnapshot>();
    let (seen_b, cb_b) = collector::<HeadSnapshot>();
    let sub_a = manager.query_head.query(h.system(), cb_a);
    let sub_b = manager.query_head.query(h.system(), cb_b);

    let reached = |seen: &Arc<Mutex<Vec<HeadSnapshot>>>, want| {
        seen.lock()
            .unwrap()
            .last()
            .and_then(|s| head_clock(s, &process))
            == Some(want)
    };
    wait_until(|| reached(&seen_a, 1) && reached(&seen_b, 1)).await;

    sub_a.unsubscribe();
    let frozen = seen_a.lock().unwrap().len();

    clock.set(20);
    let e2 = h.post("two");
    manager.update(&e2);

    wait_until(|| reached(&seen_b, 2)).await;
    assert_eq!(seen_a.lock().unwrap().len(), frozen);
    sub_b.unsubscribe();
}

#[tokio::test]
async fn test_head_never_regresses() {
    let (manager, _, _) = engine();
    let clock = Arc::new(MockClock::new(0));
    let mut h = author(2, &clock);
    let e1 = h.post("one");
    let e2 = h.post("two");
    let process = h.process();

    let (seen, cb) = collector::<HeadSnapshot>();
    let sub = manager.query_head.query(h.system(), cb);

    manager.update(&e2);
    manager.update(&e1);

    wait_until(|| {
        seen.lock()
            .unwrap()
            .last()
            .and_then(|s| head_clock(s, &process))
            == Some(2)
    })
    .await;

    // Every snapshot in the stream is monotonic
    let mut last = 0;
    for snapshot in seen.lock().unwrap().iter() {
        let clock = head_clock(snapshot, &process).unwrap_or(0);
        assert!(clock >= last, "head regressed from {} to {}", last, clock);
        last = clock;
    }
    assert_eq!(last, 2);
    sub.unsubscribe();
}

#[tokio::test]
async fn test_tombstone_resolves_both_slots() {
    let (manager, _, store) = engine();
    let clock = Arc::new(MockClock::new(100));
    let mut h = author(3, &clock);
    let post = h.post("target");
    let tomb = h.delete(&post);
    store.ingest(&post).unwrap();
    store.ingest(&tomb).unwrap();

    let (seen_target, cb_target) = collector::<SignedEvent>();
    let (seen_own, cb_own) = collector::<SignedEvent>();
    let sub_target = manager
        .query_event
        .query(h.system(), h.process(), 1, cb_target);
    let sub_own = manager.query_event.query(h.system(), h.process(), 2, cb_own);

    // Both slots resolve synchronously from disk, to the same tombstone
    assert_eq!(seen_target.lock().unwrap().as_slice(), &[tomb.clone()]);
    assert_eq!(seen_own.lock().unwrap().as_slice(), &[tomb.clone()]);

    sub_target.unsubscribe();
    sub_own.unsubscribe();
}

#[tokio::test]
#[should_panic(expected = "delete targets a delete event")]
async fn test_delete_of_delete_is_fatal() {
    let (manager, _, _) = engine();
    let clock = Arc::new(MockClock::new(100));
    let mut h = author(4, &clock);
    let post = h.post("target");
    let tomb = h.delete(&post);
    manager.update(&post);
    manager.update(&tomb);

    // A signed event claiming to delete the tombstone itself can only be
    // forged; the authoring API refuses to produce one
    let payload = Delete {
        process: h.process(),
        logical_clock: tomb.event().logical_clock,
        content_type: content::DELETE,
        indices: Indices::new(),
        unix_milliseconds: 100,
    };
    let forged = Event {
        system: h.system(),
        process: h.process(),
        logical_clock: 3,
        content_type: content::DELETE,
        content: payload.encode_to_vec(),
        lww_element: None,
        lww_element_set: None,
        references: Vec::new(),
        indices: Indices::new(),
        vector_clock: VectorClock::default(),
        unix_milliseconds: 100,
    }
    .sign(&Keypair::from_bytes(&[4; 32]));

    manager.update(&forged);
}

#[tokio::test]
async fn test_engine_clean_after_release() {
    let (manager, sim, _) = engine();
    sim.add_server("alpha");
    let clock = Arc::new(MockClock::new(10));
    let mut h = author(5, &clock);
    let e1 = h.post("one");
    sim.add_events("alpha", &[e1.clone()]);
    manager.add_address_hint(h.system(), "alpha");

    assert!(manager.clean());

    let (_, head_cb) = collector::<HeadSnapshot>();
    let (_, event_cb) = collector::<SignedEvent>();
    let (_, crdt_cb) = collector::<CrdtValue>();
    let head_sub = manager.query_head.query(h.system(), head_cb);
    let event_sub = manager.query_event.query(h.system(), h.process(), 1, event_cb);
    let crdt_sub = manager
        .query_crdt
        .query(h.system(), content::USERNAME, crdt_cb);
    assert!(!manager.clean());

    head_sub.unsubscribe();
    event_sub.unsubscribe();
    crdt_sub.unsubscribe();
    wait_until(|| manager.clean()).await;

    // Context holds pin state on their own
    let ctx = CancelContext::new();
    let e2 = h.post("two");
    manager.update_with_context_hold(&e2, &ctx);
    assert!(!manager.clean());
    ctx.cancel();
    assert!(manager.clean());

    // Subscribe-then-immediately-unsubscribe leaves nothing behind
    let (_, cb) = collector::<SignedEvent>();
    let sub = manager.query_event.query(h.system(), h.process(), 9, cb);
    sub.unsubscribe();
    wait_until(|| manager.clean()).await;
}

#[tokio::test]
async fn test_cross_process_lww_register() {
    let (manager, sim, _) = engine();
    sim.add_server("alpha");

    let clock_a = Arc::new(MockClock::new(2));
    let clock_b = Arc::new(MockClock::new(3));
    let mut device_a = author(6, &clock_a);
    let mut device_b = author(6, &clock_b);
    assert_eq!(device_a.system(), device_b.system());

    let write_a = device_a.set_crdt_item(content::USERNAME, b"2".to_vec());
    let write_b = device_b.set_crdt_item(content::USERNAME, b"3".to_vec());
    sim.add_events("alpha", &[write_a, write_b]);
    manager.add_address_hint(device_a.system(), "alpha");

    let (seen, cb) = collector::<CrdtValue>();
    let sub = manager
        .query_crdt
        .query(device_a.system(), content::USERNAME, cb);

    wait_until(|| {
        seen.lock()
            .unwrap()
            .last()
            .map(|v| v.value.as_deref() == Some(b"3") && !v.missing_data)
            .unwrap_or(false)
    })
    .await;
    sub.unsubscribe();
}

#[tokio::test]
async fn test_register_resolves_through_one_hop() {
    let (manager, sim, _) = engine();
    sim.add_server("alpha");
    let clock = Arc::new(MockClock::new(0));
    let mut h = author(13, &clock);
    clock.set(10);
    let username = h.set_crdt_item(content::USERNAME, b"alice".to_vec());
    clock.set(20);
    let newer_post = h.post("hello");
    sim.add_events("alpha", &[username, newer_post]);
    manager.add_address_hint(h.system(), "alpha");

    let (seen, cb) = collector::<CrdtValue>();
    let sub = manager.query_crdt.query(h.system(), content::USERNAME, cb);

    // The head is the post; the username write is only reachable through
    // the head's per-type index, one fetch away
    wait_until(|| {
        seen.lock()
            .unwrap()
            .last()
            .map(|v| v.value.as_deref() == Some(b"alice".as_slice()) && !v.missing_data)
            .unwrap_or(false)
    })
    .await;

    // Until the head and the referenced write have both settled, every
    // emission carries the missing-data flag; an empty register value is
    // never reported as final while loads are outstanding
    let emissions = seen.lock().unwrap().clone();
    let (settled, loading) = emissions.split_last().unwrap();
    assert_eq!(settled.value.as_deref(), Some(b"alice".as_slice()));
    assert!(!settled.missing_data);
    for value in loading {
        assert!(
            value.missing_data,
            "unflagged value {:?} while loads were outstanding",
            value
        );
    }
    sub.unsubscribe();
}

#[tokio::test]
async fn test_index_gap_placeholder_and_resolution() {
    let (manager, sim, _) = engine();
    sim.add_server("alpha");
    let clock = Arc::new(MockClock::new(0));
    let mut h = author(7, &clock);
    let mut events = Vec::new();
    for i in 1..=6u64 {
        clock.set(i * 10);
        events.push(h.post(&format!("post {}", i)));
    }
    sim.add_events("alpha", &events);
    sim.withhold("alpha", &h.system(), &h.process(), 4);
    manager.add_address_hint(h.system(), "alpha");

    let (seen, cb) = collector::<IndexPatch>();
    let handle = manager.query_index.query(h.system(), content::POST, cb);
    handle.advance(6);

    // The withheld slot shows up as a placeholder: post 5 links to clock
    // 4 but the window jumps to 3
    wait_until(|| {
        let window = fold_window(&seen.lock().unwrap());
        window.len() == 6
            && window
                .iter()
                .any(|c| c.key.logical_clock == 4 && c.value == CellValue::Missing)
    })
    .await;

    sim.release("alpha", &h.system(), &h.process(), 4);
    manager.update(&events[3]);

    let window = fold_window(&seen.lock().unwrap());
    assert_eq!(window.len(), 6);
    let clocks: Vec<u64> = window.iter().map(|c| c.key.logical_clock).collect();
    assert_eq!(clocks, vec![6, 5, 4, 3, 2, 1]);
    assert!(window
        .iter()
        .all(|c| matches!(c.value, CellValue::Event(_))));

    handle.unsubscribe();
}

#[tokio::test]
async fn test_index_load_warms_event_cache() {
    let (manager, sim, store) = engine();
    sim.add_server("alpha");
    let clock = Arc::new(MockClock::new(0));
    let mut h = author(8, &clock);
    let mut events = Vec::new();
    for i in 1..=3u64 {
        clock.set(i * 10);
        events.push(h.post(&format!("post {}", i)));
    }
    sim.add_events("alpha", &events);
    manager.add_address_hint(h.system(), "alpha");

    let (seen, cb) = collector::<IndexPatch>();
    let handle = manager.query_index.query(h.system(), content::POST, cb);
    handle.advance(3);

    wait_until(|| fold_window(&seen.lock().unwrap()).len() == 3).await;
    wait_until(|| store.event_count() == 3).await;

    // The page fan-out already persisted every event; a point query now
    // resolves from disk without any range request
    let (seen_event, event_cb) = collector::<SignedEvent>();
    let sub = manager
        .query_event
        .query(h.system(), h.process(), 2, event_cb);
    assert_eq!(seen_event.lock().unwrap().as_slice(), &[events[1].clone()]);
    assert_eq!(sim.request_count("alpha", "get_events"), 0);

    sub.unsubscribe();
    handle.unsubscribe();
}

#[tokio::test]
async fn test_crdt_set_membership() {
    let (manager, sim, _) = engine();
    sim.add_server("alpha");
    let clock = Arc::new(MockClock::new(0));
    let mut h = author(9, &clock);
    clock.set(10);
    let add_bob = h.crdt_set_op(content::FOLLOW, SetOperation::Add, b"bob".to_vec());
    clock.set(20);
    let remove_bob = h.crdt_set_op(content::FOLLOW, SetOperation::Remove, b"bob".to_vec());
    clock.set(30);
    let add_carol = h.crdt_set_op(content::FOLLOW, SetOperation::Add, b"carol".to_vec());
    sim.add_events("alpha", &[add_bob, remove_bob, add_carol]);
    manager.add_address_hint(h.system(), "alpha");

    let (seen, cb) = collector::<SetPatch>();
    let handle = manager.query_crdt_set.query(h.system(), content::FOLLOW, cb);
    handle.advance(10);

    wait_until(|| {
        fold_members(&seen.lock().unwrap())
            == [b"carol".to_vec()].into_iter().collect::<BTreeSet<_>>()
    })
    .await;

    handle.unsubscribe();
}

#[tokio::test]
async fn test_server_list_unions_hints_and_announcements() {
    let (manager, sim, _) = engine();
    sim.add_server("alpha");
    sim.add_server("beta");
    let clock = Arc::new(MockClock::new(10));
    let mut h = author(10, &clock);
    let announce = h.crdt_set_op(content::SERVER, SetOperation::Add, b"beta".to_vec());
    sim.add_events("alpha", &[announce]);
    manager.add_address_hint(h.system(), "alpha");

    let (seen, cb) = collector::<Vec<String>>();
    let sub = manager.query_servers.query(h.system(), cb);

    assert_eq!(seen.lock().unwrap().first().cloned(), Some(vec!["alpha".to_string()]));
    wait_until(|| {
        seen.lock().unwrap().last().cloned()
            == Some(vec!["alpha".to_string(), "beta".to_string()])
    })
    .await;

    sub.unsubscribe();
}

#[tokio::test]
async fn test_engine_over_disk_store() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(stele_store::DiskStore::open(dir.path()).unwrap());
    let sim = Arc::new(SimServer::new());
    let manager = QueryManager::new(store, sim);

    let clock = Arc::new(MockClock::new(0));
    let mut h = author(12, &clock);
    let mut events = Vec::new();
    for i in 1..=3u64 {
        clock.set(i * 10);
        events.push(h.post(&format!("post {}", i)));
    }
    for event in &events {
        manager.update(event);
    }

    let (seen_head, head_cb) = collector::<HeadSnapshot>();
    let head_sub = manager.query_head.query(h.system(), head_cb);
    let process = h.process();
    wait_until(|| {
        seen_head
            .lock()
            .unwrap()
            .last()
            .and_then(|s| head_clock(s, &process))
            == Some(3)
    })
    .await;

    let (seen, cb) = collector::<IndexPatch>();
    let handle = manager.query_index.query(h.system(), content::POST, cb);
    handle.advance(3);
    wait_until(|| fold_window(&seen.lock().unwrap()).len() == 3).await;

    head_sub.unsubscribe();
    handle.unsubscribe();
    wait_until(|| manager.clean()).await;
}

#[tokio::test]
#[should_panic(expected = "callback already registered")]
async fn test_duplicate_registration_is_fatal() {
    let (manager, _, _) = engine();
    let system = System::from([11u8; 32]);
    let (_, cb) = collector::<HeadSnapshot>();
    let _sub_a = manager.query_head.query(system, cb.clone());
    let _sub_b = manager.query_head.query(system, cb);
}
