//! Stele Net
//!
//! The network collaborator seam for the query engine: an object-safe
//! `ApiClient` trait over whatever transport reaches a peer server, plus
//! `SimServer`, an in-memory multi-server fixture for deterministic tests.
//!
//! The engine never depends on a concrete transport; network failures are
//! logged at call sites and never surfaced to subscribers.

pub mod sim;

use std::future::Future;
use std::pin::Pin;

use stele_model::{ContentType, Process, RangeSet, SignedEvent, System};
use thiserror::Error;

pub use sim::SimServer;

/// Error from network operations.
///
/// Intentionally transport-agnostic; implementors map their internal
/// errors into this type.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

/// Logical-clock ranges requested for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangesForProcess {
    pub process: Process,
    pub ranges: RangeSet,
}

/// One page of a server's descending timeline for a content type.
#[derive(Debug, Clone, Default)]
pub struct IndexPage {
    /// Page items, descending by time
    pub events: Vec<SignedEvent>,
    /// Supporting events a server attaches to prove page integrity
    pub proof: Vec<SignedEvent>,
    /// Time cursor to pass for the next-older page, if the server has more
    pub cursor: Option<u64>,
}

/// Object-safe client for the range-based replication protocol.
///
/// One implementation serves all known servers, addressed by name.
pub trait ApiClient: Send + Sync {
    /// Fetch events of one system by logical-clock range, per process.
    fn get_events<'a>(
        &'a self,
        server: &'a str,
        system: &'a System,
        ranges: &'a [RangesForProcess],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SignedEvent>, NetError>> + Send + 'a>>;

    /// Fetch the latest known event of each of a system's processes.
    fn get_head<'a>(
        &'a self,
        server: &'a str,
        system: &'a System,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SignedEvent>, NetError>> + Send + 'a>>;

    /// Fetch one page of the server's timeline for a content type,
    /// descending by time, strictly older than `cursor` when given.
    fn get_query_index<'a>(
        &'a self,
        server: &'a str,
        system: &'a System,
        content_type: ContentType,
        cursor: Option<u64>,
        limit: u64,
    ) -> Pin<Box<dyn Future<Output = Result<IndexPage, NetError>> + Send + 'a>>;
}
