//! QueryManager - engine assembly and cross-cache fan-out
//!
//! Owns one instance of every query component, wired so that any batch a
//! component loads from the network is ingested into the durable store
//! and pushed to every other component's `update`. A timeline fetch thus
//! warms the head and point caches for free, and no component ever sees
//! an event another component has already discarded.
//!
//! Requires a tokio runtime context: components spawn their disk and
//! network loads.

use std::sync::{Arc, Weak};

use stele_model::SignedEvent;
use stele_net::ApiClient;
use stele_store::{StateLayer, StoreError};
use tracing::warn;

use crate::cancel::CancelContext;
use crate::query_crdt_set::QueryCrdtSet;
use crate::query_event::QueryEvent;
use crate::query_head::QueryHead;
use crate::query_index::QueryIndex;
use crate::query_latest::QueryCrdt;
use crate::query_servers::QueryServers;
use crate::shared::{BatchSink, ServerSource};

/// A component that accepts pushed events.
trait Updatable: Send + Sync {
    fn update(&self, event: &SignedEvent);
}

impl Updatable for QueryHead {
    fn update(&self, event: &SignedEvent) {
        QueryHead::update(self, event);
    }
}

impl Updatable for QueryEvent {
    fn update(&self, event: &SignedEvent) {
        QueryEvent::update(self, event);
    }
}

impl Updatable for QueryIndex {
    fn update(&self, event: &SignedEvent) {
        QueryIndex::update(self, event);
    }
}

pub struct QueryManager {
    store: Arc<dyn StateLayer>,
    pub query_head: Arc<QueryHead>,
    pub query_event: Arc<QueryEvent>,
    pub query_index: Arc<QueryIndex>,
    pub query_crdt: Arc<QueryCrdt>,
    pub query_crdt_set: Arc<QueryCrdtSet>,
    pub query_servers: Arc<QueryServers>,
    updatables: Vec<Arc<dyn Updatable>>,
}

impl QueryManager {
    /// Assemble the engine over a store and a network client.
    pub fn new(store: Arc<dyn StateLayer>, client: Arc<dyn ApiClient>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<QueryManager>| {
            let sink: Weak<dyn BatchSink> = weak.clone();

            let query_servers = Arc::new(QueryServers::new());
            let servers_weak: Weak<QueryServers> = Arc::downgrade(&query_servers);
            let server_source: Weak<dyn ServerSource> = servers_weak;

            let query_head = Arc::new(QueryHead::new(
                store.clone(),
                client.clone(),
                server_source.clone(),
                sink.clone(),
            ));
            let query_event = Arc::new(QueryEvent::new(
                store.clone(),
                client.clone(),
                server_source.clone(),
                sink.clone(),
            ));
            let query_index = Arc::new(QueryIndex::new(
                store.clone(),
                client,
                server_source,
                sink,
            ));
            let query_crdt = Arc::new(QueryCrdt::new(query_head.clone(), query_event.clone()));
            let query_crdt_set = Arc::new(QueryCrdtSet::new(query_index.clone()));
            query_servers.attach(query_crdt_set.clone());

            let updatables: Vec<Arc<dyn Updatable>> = vec![
                query_head.clone(),
                query_event.clone(),
                query_index.clone(),
            ];

            QueryManager {
                store,
                query_head,
                query_event,
                query_index,
                query_crdt,
                query_crdt_set,
                query_servers,
                updatables,
            }
        })
    }

    fn ingest(&self, event: &SignedEvent) {
        match self.store.ingest(event) {
            Ok(_) => {}
            // A delete of a delete can only come from a forged or corrupt
            // log; continuing would leave caches permanently inconsistent
            Err(StoreError::InvalidDelete) => {
                panic!("delete targets a delete event");
            }
            Err(err) => {
                warn!(error = %err, "ingest failed; caches updated without durable copy");
            }
        }
    }

    /// Push one locally-observed event through the store and every cache.
    pub fn update(&self, event: &SignedEvent) {
        self.ingest(event);
        for updatable in &self.updatables {
            updatable.update(event);
        }
    }

    /// As `update`, additionally pinning the event's cache state until
    /// `hold` is cancelled. Used for optimistic writes the UI must be
    /// able to read back before any subscriber exists.
    pub fn update_with_context_hold(&self, event: &SignedEvent, hold: &CancelContext) {
        self.ingest(event);
        self.query_head.update_with_context_hold(event, hold);
        self.query_event.update_with_context_hold(event, hold);
        self.query_index.update(event);
    }

    /// Add a locally-known server address for a system.
    pub fn add_address_hint(&self, system: stele_model::System, server: impl Into<String>) {
        self.query_servers.add_address_hint(system, server);
    }

    /// True when every component has released all cache state.
    pub fn clean(&self) -> bool {
        self.query_head.clean()
            && self.query_event.clean()
            && self.query_index.clean()
            && self.query_crdt.clean()
            && self.query_crdt_set.clean()
            && self.query_servers.clean()
    }
}

impl BatchSink for QueryManager {
    fn deliver(&self, events: &[SignedEvent]) {
        for event in events {
            self.update(event);
        }
    }
}

impl std::fmt::Debug for QueryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryManager").finish_non_exhaustive()
    }
}
