use crate::node_id::NodeId;
use crate::peer_store::{DEFAULT_MAX_PEERS_PER_TORRENT, DEFAULT_MAX_TORRENTS, DEFAULT_PEER_TTL};
use crate::routing_table::DEFAULT_BUCKET_SIZE;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Well-known routers, used when no bootstrap list is configured.
pub const DEFAULT_BOOTSTRAP_NODES: [&str; 4] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
    "relay.pkarr.org:6881",
];

/// Configuration for starting a DHT node.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Address the UDP socket binds to; port 0 picks an ephemeral port
    pub bind_addr: SocketAddrV4,
    /// Fixed node id; a random one is generated when unset
    pub node_id: Option<NodeId>,
    /// `host:port` entries resolved when the node starts
    pub bootstrap_nodes: Vec<String>,
    /// Contacts kept per routing-table bucket (the K parameter)
    pub bucket_size: usize,
    /// Wait for the first answer to a request; doubles on every retry
    pub request_timeout: Duration,
    /// Datagrams spent on a request before it times out
    pub request_attempts: u32,
    /// How often the routing table is re-warmed in the background
    pub maintenance_interval: Duration,
    /// Info-hashes tracked at most, least recently used evicted first
    pub max_stored_torrents: usize,
    /// Announced peers kept per info-hash
    pub max_peers_per_torrent: usize,
    /// Age at which an announced peer is forgotten
    pub peer_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            node_id: None,
            bootstrap_nodes: DEFAULT_BOOTSTRAP_NODES
                .iter()
                .map(|node| node.to_string())
                .collect(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            request_timeout: Duration::from_secs(2),
            request_attempts: 3,
            maintenance_interval: Duration::from_secs(15 * 60),
            max_stored_torrents: DEFAULT_MAX_TORRENTS,
            max_peers_per_torrent: DEFAULT_MAX_PEERS_PER_TORRENT,
            peer_ttl: DEFAULT_PEER_TTL,
        }
    }
}
