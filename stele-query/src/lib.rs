//! Stele Query
//!
//! Incremental live-query engine over the stele event mesh. Six
//! composable components cache different read shapes of the same
//! underlying logs:
//!
//! - [`QueryHead`]: per-process latest pointers of a system
//! - [`QueryEvent`]: single events by `(process, logical clock)` slot
//! - [`QueryCrdt`]: latest-writer-wins register values
//! - [`QueryIndex`]: descending timelines with gap detection
//! - [`QueryCrdtSet`]: latest-writer-wins element sets
//! - [`QueryServers`]: where to reach a system
//!
//! [`QueryManager`] wires them over a [`stele_store::StateLayer`] and a
//! [`stele_net::ApiClient`]: every batch any component loads is ingested
//! into the store and fanned out to the others.
//!
//! Cache cells live as long as they have a subscriber callback or a
//! [`CancelContext`] hold; once both are gone the cell is reclaimed and
//! `clean()` reports an empty engine.

mod cancel;
mod manager;
mod query_crdt_set;
mod query_event;
mod query_head;
mod query_index;
mod query_latest;
mod query_servers;
mod shared;

pub use cancel::CancelContext;
pub use manager::QueryManager;
pub use query_crdt_set::{CrdtSetHandle, QueryCrdtSet, SetPatch};
pub use query_event::QueryEvent;
pub use query_head::{HeadSnapshot, QueryHead};
pub use query_index::{CellKey, CellValue, IndexCell, IndexHandle, IndexPatch, QueryIndex};
pub use query_latest::{CrdtValue, QueryCrdt};
pub use query_servers::QueryServers;
pub use shared::{Callback, Source, Subscription};
