use std::hash::{Hash, Hasher};

/// Knuth's multiplicative hashing constant, used verbatim by the collision
/// recovery step in `NodeStore::insert` when synthesizing an id for a null
/// `NodeId`.
pub(crate) const MULTIPLICATIVE_STEP: u32 = 2_654_435_761;

/// The namespace every synthesized (null-id) node lands in.
pub const LOCAL_NAMESPACE: u16 = 1;

/// The tagged payload half of a `NodeId`. Equality and hashing are
/// structural: two `Numeric` ids with the same value are equal regardless of
/// which namespace they came from only if the namespace also matches (the
/// namespace lives on `NodeId`, not here).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum NodeIdKind {
    Numeric(u32),
    String(Vec<u8>),
    Guid([u8; 16]),
    Opaque(Vec<u8>),
}

/// Tagged identifier naming a node in the address space.
///
/// `Null` is encoded as `namespace_index == 0` and `kind == Numeric(0)`; use
/// [`NodeId::null`]/[`NodeId::is_null`] rather than constructing it by hand.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId {
    pub namespace_index: u16,
    pub kind: NodeIdKind,
}

impl NodeId {
    #[inline]
    pub fn numeric(namespace_index: u16, value: u32) -> Self {
        NodeId {
            namespace_index,
            kind: NodeIdKind::Numeric(value),
        }
    }

    #[inline]
    pub fn string(namespace_index: u16, value: impl Into<Vec<u8>>) -> Self {
        NodeId {
            namespace_index,
            kind: NodeIdKind::String(value.into()),
        }
    }

    #[inline]
    pub fn guid(namespace_index: u16, value: [u8; 16]) -> Self {
        NodeId {
            namespace_index,
            kind: NodeIdKind::Guid(value),
        }
    }

    #[inline]
    pub fn opaque(namespace_index: u16, value: impl Into<Vec<u8>>) -> Self {
        NodeId {
            namespace_index,
            kind: NodeIdKind::Opaque(value.into()),
        }
    }

    #[inline]
    pub fn null() -> Self {
        NodeId {
            namespace_index: 0,
            kind: NodeIdKind::Numeric(0),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.namespace_index == 0 && matches!(self.kind, NodeIdKind::Numeric(0))
    }

    /// 64-bit avalanche-mixed hash of the tag and its payload bytes, used by
    /// the store's bucket table. Deliberately not `std::hash::Hash`'s
    /// SipHash: the store wants a cheap mix it controls directly, not a
    /// DoS-resistant general-purpose hasher.
    pub(crate) fn bucket_hash(&self) -> u64 {
        let mut h = BobJenkinsHasher::new();
        self.namespace_index.hash(&mut h);
        match &self.kind {
            NodeIdKind::Numeric(v) => {
                0u8.hash(&mut h);
                v.hash(&mut h);
            }
            NodeIdKind::String(v) => {
                1u8.hash(&mut h);
                v.hash(&mut h);
            }
            NodeIdKind::Guid(v) => {
                2u8.hash(&mut h);
                v.hash(&mut h);
            }
            NodeIdKind::Opaque(v) => {
                3u8.hash(&mut h);
                v.hash(&mut h);
            }
        }
        h.finish()
    }
}

/// One-at-a-time mixer in the style described by Bob Jenkins. Good avalanche,
/// no claim to cryptographic strength - exactly what the store needs for
/// bucket distribution.
struct BobJenkinsHasher {
    state: u64,
}

impl BobJenkinsHasher {
    fn new() -> Self {
        BobJenkinsHasher { state: 0 }
    }
}

impl Hasher for BobJenkinsHasher {
    fn finish(&self) -> u64 {
        let mut hash = self.state;
        hash = hash.wrapping_add(hash << 3);
        hash ^= hash >> 11;
        hash = hash.wrapping_add(hash << 15);
        hash
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut hash = self.state;
        for &byte in bytes {
            hash = hash.wrapping_add(byte as u64);
            hash = hash.wrapping_add(hash << 10);
            hash ^= hash >> 6;
        }
        self.state = hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_numeric_zero_in_namespace_zero() {
        let id = NodeId::null();
        assert!(id.is_null());
        assert_eq!(id.namespace_index, 0);
    }

    #[test]
    fn non_null_numeric_is_not_null() {
        assert!(!NodeId::numeric(1, 0).is_null());
        assert!(!NodeId::numeric(0, 1).is_null());
    }

    #[test]
    fn equal_ids_hash_equal() {
        let a = NodeId::numeric(1, 42);
        let b = NodeId::numeric(1, 42);
        assert_eq!(a.bucket_hash(), b.bucket_hash());
    }

    #[test]
    fn distinguishes_kind_tag_not_just_payload_bytes() {
        let numeric = NodeId::numeric(1, 5);
        let opaque = NodeId::opaque(1, vec![5, 0, 0, 0]);
        assert_ne!(numeric, opaque);
    }
}
