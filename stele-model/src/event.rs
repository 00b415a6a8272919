//! Events with strong typing: signing, verification, and wire conversions
//!
//! Ensures all fields are valid (fixed-size keys, verified signatures)
//! unlike the raw wire messages. A `SignedEvent` can only be obtained by
//! signing a local event or by decoding-and-verifying wire bytes.

use std::collections::BTreeMap;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use prost::Message;
use thiserror::Error;

use crate::content::{self, ContentType};
use crate::types::{Digest, Process, Signature, System};
use crate::wire::{
    WireDelete, WireEvent, WireIndex, WireLwwElement, WireLwwElementSet, WirePointer,
    WireSetOperation, WireSignedEvent,
};

/// Errors that can occur during event decoding and verification
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Wire decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid system key length: expected 32 bytes, got {0}")]
    InvalidSystemLength(usize),

    #[error("Invalid process id length: expected 16 bytes, got {0}")]
    InvalidProcessLength(usize),

    #[error("Invalid signature length: expected 64 bytes, got {0}")]
    InvalidSignatureLength(usize),

    #[error("Invalid digest length: expected 32 bytes, got {0}")]
    InvalidDigestLength(usize),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Unknown element-set operation: {0}")]
    UnknownSetOperation(i32),
}

/// LWW register payload: a value stamped with its write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwElement {
    pub value: Vec<u8>,
    pub unix_milliseconds: u64,
}

/// Element-set operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperation {
    Add,
    Remove,
}

/// LWW element-set payload: an add/remove of one element value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LwwElementSet {
    pub operation: SetOperation,
    pub value: Vec<u8>,
    pub unix_milliseconds: u64,
}

/// Stable reference to one event, optionally carrying its digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pointer {
    pub system: System,
    pub process: Process,
    pub logical_clock: u64,
    pub digest: Option<Digest>,
}

/// Per-process, per-type backward skip-chain.
///
/// `get(t)` is the most recent logical clock at which the writing process
/// wrote an event of content type `t` strictly before this event.
/// Non-decreasing per type across successive events from one process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Indices(BTreeMap<ContentType, u64>);

impl Indices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, content_type: ContentType) -> Option<u64> {
        self.0.get(&content_type).copied()
    }

    pub fn insert(&mut self, content_type: ContentType, logical_clock: u64) {
        self.0.insert(content_type, logical_clock);
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContentType, u64)> + '_ {
        self.0.iter().map(|(t, c)| (*t, *c))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ContentType, u64)> for Indices {
    fn from_iter<I: IntoIterator<Item = (ContentType, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Snapshot of other processes' logical clocks at write time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VectorClock(pub Vec<u64>);

/// Immutable log record authored by one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub system: System,
    pub process: Process,
    pub logical_clock: u64,
    pub content_type: ContentType,
    pub content: Vec<u8>,
    pub lww_element: Option<LwwElement>,
    pub lww_element_set: Option<LwwElementSet>,
    pub references: Vec<Pointer>,
    pub indices: Indices,
    pub vector_clock: VectorClock,
    pub unix_milliseconds: u64,
}

/// Tombstone payload: identifies a deleted event and copies its type,
/// indices, and time so chain-walking can traverse the deleted slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub process: Process,
    pub logical_clock: u64,
    pub content_type: ContentType,
    pub indices: Indices,
    pub unix_milliseconds: u64,
}

impl Delete {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        WireDelete::decode(bytes)?.try_into()
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        WireDelete::from(self.clone()).encode_to_vec()
    }
}

/// An account keypair: the signing key behind a `System`.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// The public identity derived from this keypair.
    pub fn system(&self) -> System {
        System::from(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from(self.signing.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({})", self.system())
    }
}

impl Event {
    /// Canonical bytes of this event (deterministic wire encoding).
    pub fn encode_to_vec(&self) -> Vec<u8> {
        WireEvent::from(self.clone()).encode_to_vec()
    }

    /// Sign this event to create a SignedEvent.
    ///
    /// The keypair must match `self.system`; signing under a foreign key
    /// would produce an event no verifier accepts.
    pub fn sign(self, keypair: &Keypair) -> SignedEvent {
        debug_assert_eq!(keypair.system(), self.system);
        let signature = keypair.sign(&self.encode_to_vec());
        SignedEvent {
            event: self,
            signature,
        }
    }

    /// Decode the tombstone payload, if this is a delete event.
    pub fn delete_payload(&self) -> Result<Option<Delete>, WireError> {
        if self.content_type != content::DELETE {
            return Ok(None);
        }
        Delete::decode(&self.content).map(Some)
    }

    /// Pointer to this event, without digest.
    pub fn pointer(&self) -> Pointer {
        Pointer {
            system: self.system,
            process: self.process,
            logical_clock: self.logical_clock,
            digest: None,
        }
    }
}

/// An event plus the signature proving its system authored it.
///
/// **Note on serialization**: the raw bytes are not stored. Converting to
/// wire form or computing the digest re-serializes the inner `Event`
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEvent {
    event: Event,
    signature: Signature,
}

impl SignedEvent {
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Pointer to this event, carrying its digest.
    pub fn pointer(&self) -> Pointer {
        Pointer {
            digest: Some(self.digest()),
            ..self.event.pointer()
        }
    }

    /// Content address: blake3 over the event's canonical bytes.
    pub fn digest(&self) -> Digest {
        Digest::from(*blake3::hash(&self.event.encode_to_vec()).as_bytes())
    }

    /// Verify the signature against the event content.
    pub fn verify(&self) -> Result<(), WireError> {
        let public_key = VerifyingKey::from_bytes(self.event.system.as_bytes())
            .map_err(|_| WireError::InvalidSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(self.signature.as_bytes());
        public_key
            .verify_strict(&self.event.encode_to_vec(), &signature)
            .map_err(|_| WireError::InvalidSignature)
    }

    /// Encode to wire bytes.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        WireSignedEvent {
            event: self.event.encode_to_vec(),
            signature: self.signature.to_vec(),
        }
        .encode_to_vec()
    }

    /// Decode from wire bytes, verifying the signature.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        WireSignedEvent::decode(bytes)?.try_into()
    }
}

// --- Conversions ---

impl From<LwwElement> for WireLwwElement {
    fn from(e: LwwElement) -> Self {
        WireLwwElement {
            value: e.value,
            unix_milliseconds: e.unix_milliseconds,
        }
    }
}

impl From<WireLwwElement> for LwwElement {
    fn from(w: WireLwwElement) -> Self {
        LwwElement {
            value: w.value,
            unix_milliseconds: w.unix_milliseconds,
        }
    }
}

impl From<SetOperation> for WireSetOperation {
    fn from(op: SetOperation) -> Self {
        match op {
            SetOperation::Add => WireSetOperation::Add,
            SetOperation::Remove => WireSetOperation::Remove,
        }
    }
}

impl From<LwwElementSet> for WireLwwElementSet {
    fn from(e: LwwElementSet) -> Self {
        WireLwwElementSet {
            operation: WireSetOperation::from(e.operation) as i32,
            value: e.value,
            unix_milliseconds: e.unix_milliseconds,
        }
    }
}

impl TryFrom<WireLwwElementSet> for LwwElementSet {
    type Error = WireError;

    fn try_from(w: WireLwwElementSet) -> Result<Self, Self::Error> {
        let operation = match WireSetOperation::try_from(w.operation) {
            Ok(WireSetOperation::Add) => SetOperation::Add,
            Ok(WireSetOperation::Remove) => SetOperation::Remove,
            _ => return Err(WireError::UnknownSetOperation(w.operation)),
        };
        Ok(LwwElementSet {
            operation,
            value: w.value,
            unix_milliseconds: w.unix_milliseconds,
        })
    }
}

impl From<Pointer> for WirePointer {
    fn from(p: Pointer) -> Self {
        WirePointer {
            system: p.system.to_vec(),
            process: p.process.as_bytes().to_vec(),
            logical_clock: p.logical_clock,
            digest: p.digest.map(|d| d.to_vec()),
        }
    }
}

impl TryFrom<WirePointer> for Pointer {
    type Error = WireError;

    fn try_from(w: WirePointer) -> Result<Self, Self::Error> {
        let system = System::try_from(w.system).map_err(|v| WireError::InvalidSystemLength(v.len()))?;
        let process =
            Process::try_from(w.process.as_slice()).map_err(|_| WireError::InvalidProcessLength(w.process.len()))?;
        let digest = match w.digest {
            Some(d) => {
                Some(Digest::try_from(d).map_err(|v| WireError::InvalidDigestLength(v.len()))?)
            }
            None => None,
        };
        Ok(Pointer {
            system,
            process,
            logical_clock: w.logical_clock,
            digest,
        })
    }
}

impl From<Event> for WireEvent {
    fn from(e: Event) -> Self {
        WireEvent {
            system: e.system.to_vec(),
            process: e.process.as_bytes().to_vec(),
            logical_clock: e.logical_clock,
            content_type: e.content_type,
            content: e.content,
            lww_element: e.lww_element.map(Into::into),
            lww_element_set: e.lww_element_set.map(Into::into),
            references: e.references.into_iter().map(Into::into).collect(),
            indices: e
                .indices
                .iter()
                .map(|(content_type, logical_clock)| WireIndex {
                    content_type,
                    logical_clock,
                })
                .collect(),
            vector_clock: e.vector_clock.0,
            unix_milliseconds: e.unix_milliseconds,
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = WireError;

    fn try_from(w: WireEvent) -> Result<Self, Self::Error> {
        let system = System::try_from(w.system).map_err(|v| WireError::InvalidSystemLength(v.len()))?;
        let process =
            Process::try_from(w.process.as_slice()).map_err(|_| WireError::InvalidProcessLength(w.process.len()))?;
        let lww_element_set = match w.lww_element_set {
            Some(s) => Some(LwwElementSet::try_from(s)?),
            None => None,
        };
        let references = w
            .references
            .into_iter()
            .map(Pointer::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Event {
            system,
            process,
            logical_clock: w.logical_clock,
            content_type: w.content_type,
            content: w.content,
            lww_element: w.lww_element.map(Into::into),
            lww_element_set,
            references,
            indices: w
                .indices
                .into_iter()
                .map(|i| (i.content_type, i.logical_clock))
                .collect(),
            vector_clock: VectorClock(w.vector_clock),
            unix_milliseconds: w.unix_milliseconds,
        })
    }
}

impl From<Delete> for WireDelete {
    fn from(d: Delete) -> Self {
        WireDelete {
            process: d.process.as_bytes().to_vec(),
            logical_clock: d.logical_clock,
            content_type: d.content_type,
            indices: d
                .indices
                .iter()
                .map(|(content_type, logical_clock)| WireIndex {
                    content_type,
                    logical_clock,
                })
                .collect(),
            unix_milliseconds: d.unix_milliseconds,
        }
    }
}

impl TryFrom<WireDelete> for Delete {
    type Error = WireError;

    fn try_from(w: WireDelete) -> Result<Self, Self::Error> {
        let process =
            Process::try_from(w.process.as_slice()).map_err(|_| WireError::InvalidProcessLength(w.process.len()))?;
        Ok(Delete {
            process,
            logical_clock: w.logical_clock,
            content_type: w.content_type,
            indices: w
                .indices
                .into_iter()
                .map(|i| (i.content_type, i.logical_clock))
                .collect(),
            unix_milliseconds: w.unix_milliseconds,
        })
    }
}

impl From<SignedEvent> for WireSignedEvent {
    fn from(s: SignedEvent) -> Self {
        WireSignedEvent {
            event: s.event.encode_to_vec(),
            signature: s.signature.to_vec(),
        }
    }
}

impl TryFrom<WireSignedEvent> for SignedEvent {
    type Error = WireError;

    fn try_from(w: WireSignedEvent) -> Result<Self, Self::Error> {
        let signature_bytes: [u8; 64] = w
            .signature
            .try_into()
            .map_err(|v: Vec<u8>| WireError::InvalidSignatureLength(v.len()))?;

        // Decode the event to recover the system key, then verify the
        // signature against the *raw bytes* we received.
        let event = Event::try_from(WireEvent::decode(&w.event[..])?)?;
        let public_key = VerifyingKey::from_bytes(event.system.as_bytes())
            .map_err(|_| WireError::InvalidSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature_bytes);
        public_key
            .verify_strict(&w.event, &signature)
            .map_err(|_| WireError::InvalidSignature)?;

        Ok(SignedEvent {
            event,
            signature: Signature::from(signature_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content;

    fn sample_event(keypair: &Keypair) -> Event {
        Event {
            system: keypair.system(),
            process: Process::random(),
            logical_clock: 1,
            content_type: content::POST,
            content: b"hello".to_vec(),
            lww_element: None,
            lww_element_set: None,
            references: Vec::new(),
            indices: Indices::new(),
            vector_clock: VectorClock::default(),
            unix_milliseconds: 1000,
        }
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let signed = sample_event(&keypair).sign(&keypair);
        signed.verify().unwrap();

        let decoded = SignedEvent::decode(&signed.encode_to_vec()).unwrap();
        assert_eq!(decoded, signed);
    }

    #[test]
    fn test_tampered_bytes_rejected() {
        let keypair = Keypair::generate();
        let signed = sample_event(&keypair).sign(&keypair);
        let mut wire = WireSignedEvent::from(signed);
        wire.event[0] ^= 0xFF;
        assert!(matches!(
            SignedEvent::try_from(wire),
            Err(WireError::InvalidSignature) | Err(WireError::Decode(_))
        ));
    }

    #[test]
    fn test_delete_payload_round_trip() {
        let delete = Delete {
            process: Process::random(),
            logical_clock: 4,
            content_type: content::POST,
            indices: [(content::POST, 3)].into_iter().collect(),
            unix_milliseconds: 99,
        };
        assert_eq!(Delete::decode(&delete.encode_to_vec()).unwrap(), delete);
    }

    #[test]
    fn test_digest_is_stable() {
        let keypair = Keypair::generate();
        let signed = sample_event(&keypair).sign(&keypair);
        assert_eq!(signed.digest(), signed.digest());
    }
}
