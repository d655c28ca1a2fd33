//! Node identity
//!
//! Every peer derives a 256-bit node ID from its transport identity plus a
//! deployment salt. The derived ordering arbitrates address conflicts: the
//! numerically larger ID wins.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::constants::NODE_ID_SIZE;

/// Opaque 64-bit peer identity assigned by the transport.
///
/// Carries no semantics beyond equality and hashing; it is never persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Little-endian wire form, as carried in route tuples.
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 256-bit node identifier (salted SHA-256 of the peer identity).
///
/// The derived `Ord` compares the byte array from the most significant byte
/// down, which is exactly the unsigned lexicographic order the arbitration
/// protocol relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    bytes: [u8; NODE_ID_SIZE],
}

impl NodeId {
    /// Derive the node ID for a peer: `SHA-256(peer_le_bytes || salt)`.
    ///
    /// Deterministic and bit-identical across platforms, so IDs stay
    /// comparable between heterogeneous peers of one deployment.
    pub fn generate(peer: PeerId, salt: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(peer.to_le_bytes());
        hasher.update(salt);
        let digest = hasher.finalize();

        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(&digest);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.bytes
    }

    /// True when this node outranks `other` in address arbitration.
    pub fn has_priority(&self, other: &NodeId) -> bool {
        self > other
    }

    /// Low 24 bits of the ID (least significant byte last), used to seed
    /// candidate address selection.
    pub fn low24(&self) -> u32 {
        u32::from(self.bytes[NODE_ID_SIZE - 1])
            | (u32::from(self.bytes[NODE_ID_SIZE - 2]) << 8)
            | (u32::from(self.bytes[NODE_ID_SIZE - 3]) << 16)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    const SALT: &[u8] = b"test-salt";

    #[test]
    fn test_generate_deterministic() {
        let a = NodeId::generate(PeerId(42), SALT);
        let b = NodeId::generate(PeerId(42), SALT);
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_varies_with_peer_and_salt() {
        let a = NodeId::generate(PeerId(1), SALT);
        let b = NodeId::generate(PeerId(2), SALT);
        let c = NodeId::generate(PeerId(1), b"other-salt");

        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ordering_is_total_and_antisymmetric() {
        let a = NodeId::generate(PeerId(1), SALT);
        let b = NodeId::generate(PeerId(2), SALT);

        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        assert_eq!(a.cmp(&a), Ordering::Equal);
        assert_ne!(a.has_priority(&b), b.has_priority(&a));
        assert!(!a.has_priority(&a));
    }

    #[test]
    fn test_ordering_is_msb_first() {
        let mut low = [0u8; NODE_ID_SIZE];
        let mut high = [0u8; NODE_ID_SIZE];
        low[NODE_ID_SIZE - 1] = 0xFF;
        high[0] = 0x01;

        let low = NodeId::from_bytes(low);
        let high = NodeId::from_bytes(high);
        assert!(high.has_priority(&low));
    }

    #[test]
    fn test_low24() {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[NODE_ID_SIZE - 3] = 0xAB;
        bytes[NODE_ID_SIZE - 2] = 0xCD;
        bytes[NODE_ID_SIZE - 1] = 0xEF;

        assert_eq!(NodeId::from_bytes(bytes).low24(), 0x00AB_CDEF);
    }

    #[test]
    fn test_hex() {
        let id = NodeId::from_bytes([0x0F; NODE_ID_SIZE]);
        assert_eq!(id.to_hex().len(), NODE_ID_SIZE * 2);
        assert!(id.to_hex().starts_with("0f0f"));
    }
}
