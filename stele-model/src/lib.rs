//! Stele Model
//!
//! Core types for the stele decentralized identity log:
//! - **System**: Account identity (Ed25519 public key)
//! - **Process**: One device/writer's log within a system
//! - **Event / SignedEvent**: Atomic log records with per-type skip-chain indices
//! - **Delete**: Tombstone payload preserving chain metadata
//! - **LwwElement / LwwElementSet**: CRDT register and element-set payloads
//! - **ProcessHandle**: Authoring helper maintaining clock and indices
//! - **Ranges**: Closed-interval set algebra over logical clocks
//! - **Clock**: Time abstraction for testability

pub mod clock;
pub mod content;
pub mod event;
pub mod process;
pub mod ranges;
pub mod types;
pub mod wire;

pub use clock::{Clock, MockClock, SystemClock};
pub use content::ContentType;
pub use event::{
    Delete, Event, Indices, Keypair, LwwElement, LwwElementSet, Pointer, SetOperation,
    SignedEvent, VectorClock, WireError,
};
pub use process::ProcessHandle;
pub use ranges::{Range, RangeSet};
pub use types::{Digest, Process, Signature, System};
