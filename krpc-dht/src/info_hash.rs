use crate::node_id::{NODE_ID_LEN, NodeId};
use std::fmt;

/// 20-byte torrent identifier. Shares the id space with [`NodeId`] so
/// lookups can measure XOR distance against it, but the two are distinct
/// types on purpose.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; NODE_ID_LEN]);

impl InfoHash {
    pub fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        InfoHash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(InfoHash)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().and_then(|b| Self::from_slice(&b))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<&InfoHash> for NodeId {
    fn from(hash: &InfoHash) -> Self {
        NodeId::new(hash.0)
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
