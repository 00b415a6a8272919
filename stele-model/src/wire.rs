//! Wire representation of protocol messages
//!
//! Hand-written `prost` message structs. The exact production wire format is
//! out of scope; these messages exist so events have one canonical,
//! deterministic byte encoding for signing, hashing, and storage.

/// Wire form of an event, the unit of the append-only per-process log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireEvent {
    #[prost(bytes = "vec", tag = "1")]
    pub system: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub process: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub logical_clock: u64,
    #[prost(uint64, tag = "4")]
    pub content_type: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub content: Vec<u8>,
    #[prost(message, optional, tag = "6")]
    pub lww_element: Option<WireLwwElement>,
    #[prost(message, optional, tag = "7")]
    pub lww_element_set: Option<WireLwwElementSet>,
    #[prost(message, repeated, tag = "8")]
    pub references: Vec<WirePointer>,
    #[prost(message, repeated, tag = "9")]
    pub indices: Vec<WireIndex>,
    #[prost(uint64, repeated, tag = "10")]
    pub vector_clock: Vec<u64>,
    #[prost(uint64, tag = "11")]
    pub unix_milliseconds: u64,
}

/// An event's canonical bytes plus the author system's signature over them.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireSignedEvent {
    #[prost(bytes = "vec", tag = "1")]
    pub event: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
}

/// Stable reference to one event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WirePointer {
    #[prost(bytes = "vec", tag = "1")]
    pub system: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub process: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub logical_clock: u64,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub digest: Option<Vec<u8>>,
}

/// One entry of the per-process, per-type backward skip-chain.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireIndex {
    #[prost(uint64, tag = "1")]
    pub content_type: u64,
    #[prost(uint64, tag = "2")]
    pub logical_clock: u64,
}

/// LWW register payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireLwwElement {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub unix_milliseconds: u64,
}

/// LWW element-set payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireLwwElementSet {
    #[prost(enumeration = "WireSetOperation", tag = "1")]
    pub operation: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub unix_milliseconds: u64,
}

/// Element-set operation discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WireSetOperation {
    Unspecified = 0,
    Add = 1,
    Remove = 2,
}

/// Tombstone payload: identifies a deleted event and copies its chain
/// metadata so chain-walking can still traverse through the deleted slot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireDelete {
    #[prost(bytes = "vec", tag = "1")]
    pub process: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub logical_clock: u64,
    #[prost(uint64, tag = "3")]
    pub content_type: u64,
    #[prost(message, repeated, tag = "4")]
    pub indices: Vec<WireIndex>,
    #[prost(uint64, tag = "5")]
    pub unix_milliseconds: u64,
}

/// A closed interval of logical clocks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireRange {
    #[prost(uint64, tag = "1")]
    pub low: u64,
    #[prost(uint64, tag = "2")]
    pub high: u64,
}

/// Logical-clock ranges requested for one process.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireRangesForProcess {
    #[prost(bytes = "vec", tag = "1")]
    pub process: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub ranges: Vec<WireRange>,
}
