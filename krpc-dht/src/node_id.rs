use rand::Rng;
use std::fmt;
use std::ops::BitXor;

pub const NODE_ID_LEN: usize = 20;

/// 160-bit Kademlia node identifier.
///
/// Distance between two ids is their XOR, compared lexicographically as
/// bytes. Ids are `Copy`; everything downstream passes them by value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Uniformly random id. Cryptographic strength is not required here;
    /// the process RNG is plenty.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::rng().fill(&mut bytes);
        NodeId(bytes)
    }

    /// `None` unless the slice is exactly 20 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(NodeId)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|b| Self::from_slice(&b))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> NodeId {
        *self ^ *other
    }

    /// Number of leading bits shared with `other`, in `[0, 160)`.
    ///
    /// Calling this with two equal ids is a caller bug: equal ids have no
    /// first differing bit, and the routing table never stores the local id.
    pub fn shared_prefix_len(&self, other: &NodeId) -> usize {
        assert_ne!(self, other, "shared prefix of an id with itself");
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return i * 8 + diff.leading_zeros() as usize;
            }
        }
        unreachable!("ids compared equal byte-wise");
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; NODE_ID_LEN]
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: Self) -> Self::Output {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ rhs.0[i];
        }
        NodeId(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
