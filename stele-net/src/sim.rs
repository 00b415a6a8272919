//! SimServer - simulated multi-server network for deterministic tests
//!
//! Holds per-server event sets in memory and answers the `ApiClient`
//! protocol synchronously. Supports withholding individual events from
//! responses (gap injection) and counts requests per server and method so
//! tests can assert that cache fan-out avoids duplicate round-trips.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use stele_model::{ContentType, Process, SignedEvent, System};

use crate::{ApiClient, IndexPage, NetError, RangesForProcess};

#[derive(Default)]
struct ServerState {
    /// (system, process, logical_clock) -> event (or tombstone stand-in)
    events: BTreeMap<(System, Process, u64), SignedEvent>,
    /// Slots omitted from every response
    withheld: BTreeSet<(System, Process, u64)>,
    /// Cap on index page size, regardless of the requested limit
    page_limit: u64,
}

#[derive(Default)]
struct SimInner {
    servers: BTreeMap<String, ServerState>,
    counters: BTreeMap<(String, &'static str), u64>,
}

/// In-memory stand-in for a set of peer servers.
#[derive(Default)]
pub struct SimServer {
    inner: Mutex<SimInner>,
}

impl SimServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server by name.
    pub fn add_server(&self, server: &str) {
        self.inner
            .lock()
            .unwrap()
            .servers
            .entry(server.to_string())
            .or_insert_with(|| ServerState {
                page_limit: u64::MAX,
                ..Default::default()
            });
    }

    /// Seed events onto a server. Delete events also re-point their
    /// target slot, mirroring what a real server's store does.
    pub fn add_events(&self, server: &str, events: &[SignedEvent]) {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .servers
            .get_mut(server)
            .unwrap_or_else(|| panic!("unknown sim server {}", server));
        for signed in events {
            let ev = signed.event();
            if let Ok(Some(payload)) = ev.delete_payload() {
                state
                    .events
                    .insert((ev.system, payload.process, payload.logical_clock), signed.clone());
            }
            state
                .events
                .insert((ev.system, ev.process, ev.logical_clock), signed.clone());
        }
    }

    /// Omit one slot from every future response of `server`.
    pub fn withhold(&self, server: &str, system: &System, process: &Process, logical_clock: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.servers.get_mut(server) {
            state.withheld.insert((*system, *process, logical_clock));
        }
    }

    /// Stop omitting a previously withheld slot.
    pub fn release(&self, server: &str, system: &System, process: &Process, logical_clock: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.servers.get_mut(server) {
            state.withheld.remove(&(*system, *process, logical_clock));
        }
    }

    /// Cap index pages served by `server` at `limit` items.
    pub fn set_page_limit(&self, server: &str, limit: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.servers.get_mut(server) {
            state.page_limit = limit;
        }
    }

    /// How many requests of `method` has `server` answered?
    pub fn request_count(&self, server: &str, method: &'static str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .counters
            .get(&(server.to_string(), method))
            .copied()
            .unwrap_or(0)
    }

    fn do_get_events(
        &self,
        server: &str,
        system: &System,
        ranges: &[RangesForProcess],
    ) -> Result<Vec<SignedEvent>, NetError> {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .counters
            .entry((server.to_string(), "get_events"))
            .or_insert(0) += 1;
        let state = inner
            .servers
            .get(server)
            .ok_or_else(|| NetError::UnknownServer(server.to_string()))?;

        let mut out = Vec::new();
        for request in ranges {
            for logical_clock in request.ranges.values() {
                let key = (*system, request.process, logical_clock);
                if state.withheld.contains(&key) {
                    continue;
                }
                if let Some(event) = state.events.get(&key) {
                    out.push(event.clone());
                }
            }
        }
        Ok(out)
    }

    fn do_get_head(&self, server: &str, system: &System) -> Result<Vec<SignedEvent>, NetError> {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .counters
            .entry((server.to_string(), "get_head"))
            .or_insert(0) += 1;
        let state = inner
            .servers
            .get(server)
            .ok_or_else(|| NetError::UnknownServer(server.to_string()))?;

        let mut heads: BTreeMap<Process, SignedEvent> = BTreeMap::new();
        for ((s, process, logical_clock), event) in &state.events {
            if s != system || state.withheld.contains(&(*s, *process, *logical_clock)) {
                continue;
            }
            match heads.get(process) {
                Some(existing) if existing.event().logical_clock >= *logical_clock => {}
                _ => {
                    heads.insert(*process, event.clone());
                }
            }
        }
        Ok(heads.into_values().collect())
    }

    fn do_get_query_index(
        &self,
        server: &str,
        system: &System,
        content_type: ContentType,
        cursor: Option<u64>,
        limit: u64,
    ) -> Result<IndexPage, NetError> {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .counters
            .entry((server.to_string(), "get_query_index"))
            .or_insert(0) += 1;
        let state = inner
            .servers
            .get(server)
            .ok_or_else(|| NetError::UnknownServer(server.to_string()))?;

        // Effective position of a stored slot: a tombstone stand-in keeps
        // the deleted event's type and time.
        let mut entries: Vec<(u64, Process, u64, SignedEvent)> = Vec::new();
        for ((s, process, logical_clock), event) in &state.events {
            if s != system || state.withheld.contains(&(*s, *process, *logical_clock)) {
                continue;
            }
            let ev = event.event();
            let stand_in = ev.process != *process || ev.logical_clock != *logical_clock;
            let (slot_type, slot_time) = if stand_in {
                match ev.delete_payload() {
                    Ok(Some(payload)) => (payload.content_type, payload.unix_milliseconds),
                    _ => continue,
                }
            } else {
                (ev.content_type, ev.unix_milliseconds)
            };
            if slot_type != content_type {
                continue;
            }
            if let Some(c) = cursor {
                if slot_time >= c {
                    continue;
                }
            }
            entries.push((slot_time, *process, *logical_clock, event.clone()));
        }
        entries.sort_by(|a, b| {
            (b.0, b.1, b.2).cmp(&(a.0, a.1, a.2))
        });

        let page_size = limit.min(state.page_limit) as usize;
        let truncated = entries.len() > page_size;
        entries.truncate(page_size);
        let cursor = if truncated {
            entries.last().map(|(time, _, _, _)| *time)
        } else {
            None
        };
        Ok(IndexPage {
            events: entries.into_iter().map(|(_, _, _, e)| e).collect(),
            proof: Vec::new(),
            cursor,
        })
    }
}

impl ApiClient for SimServer {
    fn get_events<'a>(
        &'a self,
        server: &'a str,
        system: &'a System,
        ranges: &'a [RangesForProcess],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SignedEvent>, NetError>> + Send + 'a>> {
        let result = self.do_get_events(server, system, ranges);
        Box::pin(async move { result })
    }

    fn get_head<'a>(
        &'a self,
        server: &'a str,
        system: &'a System,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SignedEvent>, NetError>> + Send + 'a>> {
        let result = self.do_get_head(server, system);
        Box::pin(async move { result })
    }

    fn get_query_index<'a>(
        &'a self,
        server: &'a str,
        system: &'a System,
        content_type: ContentType,
        cursor: Option<u64>,
        limit: u64,
    ) -> Pin<Box<dyn Future<Output = Result<IndexPage, NetError>> + Send + 'a>> {
        let result = self.do_get_query_index(server, system, content_type, cursor, limit);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stele_model::{content, Keypair, MockClock, ProcessHandle, RangeSet};

    fn seeded() -> (SimServer, ProcessHandle, Vec<SignedEvent>) {
        let sim = SimServer::new();
        sim.add_server("alpha");
        let clock = Arc::new(MockClock::new(0));
        let mut h = ProcessHandle::with_clock(Keypair::generate(), clock.clone());
        let mut events = Vec::new();
        for i in 1..=4u64 {
            clock.set(i * 10);
            events.push(h.post(&format!("post {}", i)));
        }
        sim.add_events("alpha", &events);
        (sim, h, events)
    }

    #[tokio::test]
    async fn test_get_events_by_range() {
        let (sim, h, events) = seeded();
        let request = RangesForProcess {
            process: h.process(),
            ranges: [2u64, 3].into_iter().collect::<RangeSet>(),
        };
        let got = sim
            .get_events("alpha", &h.system(), &[request])
            .await
            .unwrap();
        assert_eq!(got, vec![events[1].clone(), events[2].clone()]);
        assert_eq!(sim.request_count("alpha", "get_events"), 1);
    }

    #[tokio::test]
    async fn test_get_head_returns_latest_per_process() {
        let (sim, h, events) = seeded();
        let heads = sim.get_head("alpha", &h.system()).await.unwrap();
        assert_eq!(heads, vec![events[3].clone()]);
    }

    #[tokio::test]
    async fn test_query_index_pagination_and_withhold() {
        let (sim, h, events) = seeded();
        sim.withhold("alpha", &h.system(), &h.process(), 3);

        let page = sim
            .get_query_index("alpha", &h.system(), content::POST, None, 2)
            .await
            .unwrap();
        assert_eq!(page.events, vec![events[3].clone(), events[1].clone()]);
        assert_eq!(page.cursor, Some(20));

        let rest = sim
            .get_query_index("alpha", &h.system(), content::POST, page.cursor, 2)
            .await
            .unwrap();
        assert_eq!(rest.events, vec![events[0].clone()]);
        assert_eq!(rest.cursor, None);
    }
}
