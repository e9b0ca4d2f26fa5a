//! KRPC wire model (BEP-0005).
//!
//! Every message is a bencoded dictionary with a transaction id `t` and a
//! type `y` of `q` (query), `r` (response) or `e` (error). Decoding is
//! two-staged so the transport can tell apart datagrams that deserve an
//! error reply (a known query with bad arguments) from ones that are just
//! dropped (malformed noise, unknown query names).

use bencode::{Bencode, BencodeBuilder, BencodeDict};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

use crate::info_hash::InfoHash;
use crate::node_id::NodeId;

/// 20-byte id + 4-byte IPv4 + 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;
/// 4-byte IPv4 + 2-byte port.
pub const COMPACT_ADDR_LEN: usize = 6;

/// KRPC error codes (BEP-0005).
pub const ERR_GENERIC: i64 = 201;
pub const ERR_SERVER: i64 = 202;
pub const ERR_PROTOCOL: i64 = 203;
pub const ERR_METHOD_UNKNOWN: i64 = 204;

/// Transaction id as it appears on the wire. Ours are two big-endian bytes;
/// foreign queries may use any length and replies echo theirs verbatim.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(Bytes);

impl TransactionId {
    pub fn from_u16(value: u16) -> Self {
        TransactionId(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        TransactionId(Bytes::copy_from_slice(bytes))
    }

    /// `Some` only for the 2-byte ids we allocate ourselves.
    pub fn as_u16(&self) -> Option<u16> {
        match *self.0 {
            [hi, lo] => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNodeInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcMessage {
    pub tx_id: TransactionId,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Query(Query),
    Response(Response),
    Error(KrpcError),
}

/// The four standard queries. The enum is closed on purpose: dispatch is a
/// `match`, and an unrecognized name never gets past decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
        implied_port: bool,
    },
}

/// Query discriminant, used as half of the in-flight dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl Query {
    pub fn name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }

    pub fn kind(&self) -> QueryKind {
        match self {
            Query::Ping { .. } => QueryKind::Ping,
            Query::FindNode { .. } => QueryKind::FindNode,
            Query::GetPeers { .. } => QueryKind::GetPeers,
            Query::AnnouncePeer { .. } => QueryKind::AnnouncePeer,
        }
    }

    /// The sender's claimed id.
    pub fn id(&self) -> NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => *id,
        }
    }

    fn encode_args(&self) -> Bencode {
        let mut args: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
        let id = self.id();
        args.insert_field("id", &id.as_bytes().as_slice());
        match self {
            Query::Ping { .. } => {}
            Query::FindNode { target, .. } => {
                args.insert_field("target", &target.as_bytes().as_slice());
            }
            Query::GetPeers { info_hash, .. } => {
                args.insert_field("info_hash", &info_hash.as_bytes().as_slice());
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                args.insert_field("implied_port", &(*implied_port as i64));
                args.insert_field("info_hash", &info_hash.as_bytes().as_slice());
                args.insert_field("port", &(*port as i64));
                args.insert_field("token", token);
            }
        }
        args.build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Responder's id.
    pub id: NodeId,
    pub nodes: Vec<CompactNodeInfo>,
    pub values: Vec<SocketAddrV4>,
    pub token: Option<Bytes>,
    /// Address the responder saw the request come from (top-level `ip` key).
    pub requester_ip: Option<SocketAddrV4>,
}

impl Response {
    pub fn with_id(id: NodeId) -> Self {
        Response {
            id,
            nodes: Vec::new(),
            values: Vec::new(),
            token: None,
            requester_ip: None,
        }
    }

    fn encode_fields(&self) -> Bencode {
        let mut r: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
        r.insert_field("id", &self.id.as_bytes().as_slice());
        if !self.nodes.is_empty() {
            r.insert_field("nodes", &encode_compact_nodes(&self.nodes).as_slice());
        }
        if let Some(token) = &self.token {
            r.insert_field("token", token);
        }
        if !self.values.is_empty() {
            let values: Vec<Bencode> = self
                .values
                .iter()
                .map(|addr| Bencode::Bytes(encode_compact_addr(addr).to_vec()))
                .collect();
            r.insert_field("values", &values);
        }
        r.build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

/// Why a datagram failed to decode, split by how the transport must react.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not a KRPC message at all. Logged and dropped.
    #[error("malformed datagram: {0}")]
    Malformed(String),
    /// A query we could parse far enough to answer with a KRPC error.
    #[error("invalid query: {reason}")]
    Invalid {
        tx_id: TransactionId,
        reason: String,
    },
    /// Well-formed query with a name outside BEP-0005. Logged and ignored.
    #[error("unknown query {name:?}")]
    UnknownQuery {
        tx_id: TransactionId,
        name: String,
    },
}

fn malformed(what: &str) -> DecodeError {
    DecodeError::Malformed(what.to_string())
}

fn invalid(tx_id: &TransactionId, reason: &str) -> DecodeError {
    DecodeError::Invalid {
        tx_id: tx_id.clone(),
        reason: reason.to_string(),
    }
}

impl KrpcMessage {
    pub fn query(tx_id: TransactionId, query: Query) -> Self {
        KrpcMessage {
            tx_id,
            body: MessageBody::Query(query),
        }
    }

    pub fn response(tx_id: TransactionId, response: Response) -> Self {
        KrpcMessage {
            tx_id,
            body: MessageBody::Response(response),
        }
    }

    pub fn error(tx_id: TransactionId, code: i64, message: impl Into<String>) -> Self {
        KrpcMessage {
            tx_id,
            body: MessageBody::Error(KrpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut msg: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
        msg.insert_field("t", &self.tx_id.as_bytes());
        match &self.body {
            MessageBody::Query(query) => {
                msg.insert_field("a", &query.encode_args());
                msg.insert_field("q", &query.name());
                msg.insert_field("y", &"q");
            }
            MessageBody::Response(response) => {
                if let Some(ip) = &response.requester_ip {
                    msg.insert_field("ip", &encode_compact_addr(ip).as_slice());
                }
                msg.insert_field("r", &response.encode_fields());
                msg.insert_field("y", &"r");
            }
            MessageBody::Error(err) => {
                let payload = vec![
                    Bencode::Int(err.code),
                    Bencode::Bytes(err.message.clone().into_bytes()),
                ];
                msg.insert_field("e", &payload);
                msg.insert_field("y", &"e");
            }
        }
        msg.build().encode()
    }

    pub fn from_bytes(data: &[u8]) -> Result<KrpcMessage, DecodeError> {
        let value = Bencode::decode(data).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Bencode::Dict(dict) = value else {
            return Err(malformed("top-level value is not a dictionary"));
        };
        let tx_id = TransactionId::from_slice(
            dict.get_bytes(b"t").ok_or_else(|| malformed("missing transaction id"))?,
        );
        match dict.get_str(b"y") {
            Some("q") => decode_query(tx_id, &dict),
            Some("r") => decode_response(tx_id, &dict),
            Some("e") => Ok(decode_error(tx_id, &dict)),
            _ => Err(malformed("missing or unknown message type")),
        }
    }
}

fn decode_query(
    tx_id: TransactionId,
    dict: &BTreeMap<Vec<u8>, Bencode>,
) -> Result<KrpcMessage, DecodeError> {
    let name = dict
        .get_str(b"q")
        .ok_or_else(|| invalid(&tx_id, "missing query name"))?;
    // unknown names are ignored outright, before argument validation can
    // turn them into an error reply
    if !matches!(name, "ping" | "find_node" | "get_peers" | "announce_peer") {
        return Err(DecodeError::UnknownQuery {
            tx_id,
            name: name.to_string(),
        });
    }
    let args = dict
        .get_dict(b"a")
        .ok_or_else(|| invalid(&tx_id, "missing arguments"))?;
    let id = args
        .get_bytes(b"id")
        .and_then(NodeId::from_slice)
        .ok_or_else(|| invalid(&tx_id, "missing or invalid id"))?;

    let query = match name {
        "ping" => Query::Ping { id },
        "find_node" => {
            let target = args
                .get_bytes(b"target")
                .and_then(NodeId::from_slice)
                .ok_or_else(|| invalid(&tx_id, "missing or invalid target"))?;
            Query::FindNode { id, target }
        }
        "get_peers" => {
            let info_hash = args
                .get_bytes(b"info_hash")
                .and_then(InfoHash::from_slice)
                .ok_or_else(|| invalid(&tx_id, "missing or invalid info_hash"))?;
            Query::GetPeers { id, info_hash }
        }
        "announce_peer" => {
            let info_hash = args
                .get_bytes(b"info_hash")
                .and_then(InfoHash::from_slice)
                .ok_or_else(|| invalid(&tx_id, "missing or invalid info_hash"))?;
            let port = args
                .get_i64(b"port")
                .ok_or_else(|| invalid(&tx_id, "missing port"))?;
            let port = u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid(&tx_id, "port out of range"))?;
            let token = args
                .get_bytes(b"token")
                .filter(|t| !t.is_empty())
                .ok_or_else(|| invalid(&tx_id, "missing or empty token"))?;
            // absent means "use the UDP source port"
            let implied_port = args.get_i64(b"implied_port").map_or(true, |v| v != 0);
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                token: Bytes::copy_from_slice(token),
                implied_port,
            }
        }
        _ => unreachable!("query name checked above"),
    };
    Ok(KrpcMessage::query(tx_id, query))
}

fn decode_response(
    tx_id: TransactionId,
    dict: &BTreeMap<Vec<u8>, Bencode>,
) -> Result<KrpcMessage, DecodeError> {
    let r = dict
        .get_dict(b"r")
        .ok_or_else(|| malformed("response without result dictionary"))?;
    let id = r
        .get_bytes(b"id")
        .and_then(NodeId::from_slice)
        .ok_or_else(|| malformed("response with missing or invalid id"))?;

    let nodes = r
        .get_bytes(b"nodes")
        .map(decode_compact_nodes)
        .unwrap_or_default();
    let values = r
        .get_list(b"values")
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| match entry {
                    Bencode::Bytes(b) => decode_compact_addr(b),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let token = r.get_bytes(b"token").map(Bytes::copy_from_slice);
    let requester_ip = dict.get_bytes(b"ip").and_then(decode_compact_addr);

    Ok(KrpcMessage::response(
        tx_id,
        Response {
            id,
            nodes,
            values,
            token,
            requester_ip,
        },
    ))
}

/// Error payloads are decoded leniently; a peer that bothered to send `y=e`
/// gets through even with a mangled `e` list.
fn decode_error(tx_id: TransactionId, dict: &BTreeMap<Vec<u8>, Bencode>) -> KrpcMessage {
    let payload = dict.get_list(b"e").unwrap_or(&[]);
    let code = match payload.first() {
        Some(Bencode::Int(code)) => *code,
        _ => 0,
    };
    let message = match payload.get(1) {
        Some(Bencode::Bytes(msg)) => String::from_utf8_lossy(msg).into_owned(),
        _ => String::new(),
    };
    KrpcMessage {
        tx_id,
        body: MessageBody::Error(KrpcError { code, message }),
    }
}

pub fn encode_compact_addr(addr: &SocketAddrV4) -> [u8; COMPACT_ADDR_LEN] {
    let ip = addr.ip().octets();
    let port = addr.port().to_be_bytes();
    [ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
}

pub fn decode_compact_addr(bytes: &[u8]) -> Option<SocketAddrV4> {
    match *bytes {
        [a, b, c, d, hi, lo] => Some(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            u16::from_be_bytes([hi, lo]),
        )),
        _ => None,
    }
}

pub fn encode_compact_nodes(nodes: &[CompactNodeInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        out.extend_from_slice(node.id.as_bytes());
        out.extend_from_slice(&encode_compact_addr(&node.addr));
    }
    out
}

/// A blob whose length is not a multiple of 26 decodes to an empty list;
/// peers sending truncated node lists are noisy, not fatal.
pub fn decode_compact_nodes(blob: &[u8]) -> Vec<CompactNodeInfo> {
    if blob.len() % COMPACT_NODE_LEN != 0 {
        tracing::debug!(len = blob.len(), "discarding node list with invalid length");
        return Vec::new();
    }
    blob.chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let mut id = [0u8; 20];
            id.copy_from_slice(&chunk[..20]);
            CompactNodeInfo {
                id: NodeId::new(id),
                addr: SocketAddrV4::new(
                    Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]),
                    u16::from_be_bytes([chunk[24], chunk[25]]),
                ),
            }
        })
        .collect()
}
