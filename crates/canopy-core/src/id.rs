//! Identity types for the Canopy overlay
//!
//! Node identities are 64-bit fingerprints; publication and key identities
//! are fixed 128-bit values validated at the boundary.

use std::fmt;

use crate::{CanopyError, CanopyResult};

/// Node identity - cryptographic fingerprint (truncated hash of public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ZERO: NodeId = NodeId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        NodeId(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({:016x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Size of publication and key identifiers in bytes
pub const ID128_SIZE: usize = 16;

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{:02x}", b)?;
    }
    Ok(())
}

/// Publication identity - 128-bit, chosen randomly by the publisher
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PubId(pub [u8; ID128_SIZE]);

impl PubId {
    pub const ZERO: PubId = PubId([0; ID128_SIZE]);

    /// Generate a fresh random publication id
    pub fn generate() -> Self {
        PubId(rand::random())
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; ID128_SIZE]) -> Self {
        PubId(bytes)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; ID128_SIZE] {
        self.0
    }
}

impl fmt::Debug for PubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pub({})", self)
    }
}

impl fmt::Display for PubId {
    /// Canonical 8-4-4-4-12 form
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0[0..4])?;
        f.write_str("-")?;
        write_hex(f, &self.0[4..6])?;
        f.write_str("-")?;
        write_hex(f, &self.0[6..8])?;
        f.write_str("-")?;
        write_hex(f, &self.0[8..10])?;
        f.write_str("-")?;
        write_hex(f, &self.0[10..16])
    }
}

/// Identity of a single publication within the overlay: (uuid, sequence)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PublicationId {
    pub pub_id: PubId,
    pub seq: u32,
}

impl PublicationId {
    #[inline]
    pub fn new(pub_id: PubId, seq: u32) -> Self {
        PublicationId { pub_id, seq }
    }
}

impl fmt::Debug for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Publication({}#{})", self.pub_id, self.seq)
    }
}

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pub_id, self.seq)
    }
}

/// Key identity - names an entry in a key store
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct KeyId(pub [u8; ID128_SIZE]);

impl KeyId {
    #[inline]
    pub fn new(bytes: [u8; ID128_SIZE]) -> Self {
        KeyId(bytes)
    }

    /// Validate a byte sequence of declared length as a key id
    pub fn from_slice(bytes: &[u8]) -> CanopyResult<Self> {
        let arr: [u8; ID128_SIZE] = bytes.try_into().map_err(|_| CanopyError::InvalidKey {
            expected: ID128_SIZE,
            actual: bytes.len(),
        })?;
        Ok(KeyId(arr))
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; ID128_SIZE] {
        self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Local subscription handle, unique per node
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    #[inline]
    pub fn new(id: u64) -> Self {
        SubscriptionId(id)
    }
}

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
