//! Stele Store
//!
//! Durable storage for signed events plus the indexes the query engine
//! reads: per-process heads, per-type descending time indexes, and CRDT
//! register / element-set materializations.
//!
//! The engine consumes the `StateLayer` trait; two implementations are
//! provided:
//! - **MemoryStore**: BTreeMap-backed, for tests and ephemeral sessions
//! - **DiskStore**: redb-backed embedded storage

pub mod disk;
pub mod memory;

use stele_model::{ContentType, Process, SetOperation, SignedEvent, System, WireError};
use thiserror::Error;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Delete targets an event that is itself a delete")]
    InvalidDelete,

    #[error("Corrupt store state: {0}")]
    Corrupt(String),
}

/// Result of ingesting one signed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Event was applied and indexed
    Applied,
    /// Event was already present (or its slot is tombstoned); nothing changed
    Duplicate,
}

/// One process's position within a system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessState {
    pub process: Process,
    pub head_clock: u64,
}

/// Materialized LWW register value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdtItem {
    pub content_type: ContentType,
    pub value: Vec<u8>,
    pub unix_milliseconds: u64,
}

/// Materialized LWW element-set entry (winning operation per value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrdtSetItem {
    pub content_type: ContentType,
    pub value: Vec<u8>,
    pub operation: SetOperation,
    pub unix_milliseconds: u64,
}

/// Everything the store knows about one system, in one read.
#[derive(Debug, Clone, Default)]
pub struct SystemState {
    pub processes: Vec<ProcessState>,
    pub crdt_items: Vec<CrdtItem>,
    pub crdt_set_items: Vec<CrdtSetItem>,
}

/// The durable store/index layer consumed by the query engine.
///
/// Methods are synchronous; callers treat them as suspension points by
/// invoking them from spawned tasks. Implementations are internally
/// locked and never call back into the engine.
pub trait StateLayer: Send + Sync {
    /// Point lookup of one event. For a tombstoned slot this returns the
    /// delete event standing in at that position.
    fn get_signed_event(
        &self,
        system: &System,
        process: &Process,
        logical_clock: u64,
    ) -> Result<Option<SignedEvent>, StoreError>;

    /// Newest stored event of `content_type` across the system's
    /// processes, skipping tombstoned slots.
    fn get_latest(
        &self,
        system: &System,
        content_type: ContentType,
    ) -> Result<Option<SignedEvent>, StoreError>;

    /// Per-process heads plus materialized CRDT state for a system.
    fn query_system_state(&self, system: &System) -> Result<SystemState, StoreError>;

    /// Events of `content_type` descending by `unix_milliseconds`,
    /// strictly older than `cursor` when given. Tombstoned slots are
    /// returned as their stand-in delete events so chain-walking callers
    /// can traverse through them.
    fn query_by_time_descending(
        &self,
        system: &System,
        content_type: ContentType,
        cursor: Option<u64>,
        limit: u64,
    ) -> Result<Vec<SignedEvent>, StoreError>;

    /// Idempotent ingest of one event: stores it, advances the head,
    /// maintains the time index and CRDT materializations. A delete
    /// payload re-points the tombstoned slot at the delete event.
    fn ingest(&self, signed_event: &SignedEvent) -> Result<IngestOutcome, StoreError>;
}
