//! BitTorrent Mainline DHT node (BEP 0005).
//!
//! This crate implements the Kademlia-based peer discovery network used by
//! BitTorrent, supporting:
//! - the four standard KRPC queries `ping`, `find_node`, `get_peers` and
//!   `announce_peer` over bencoded UDP datagrams
//! - an XOR-metric routing table where senders earn admission by answering
//!   a liveness ping
//! - iterative lookups driven by a frontier of not-yet-queried addresses
//! - a bounded peer store handing out announce tokens tied to the
//!   requester's IP
//!
//! # Example
//!
//! ```no_run
//! use krpc_dht::{Dht, DhtConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Start a node and warm its routing table from the default routers
//!     let dht = Dht::start(DhtConfig::default()).await?;
//!     let contacts = dht
//!         .bootstrap_by_find_node(None, Duration::from_secs(30))
//!         .await?;
//!     println!("discovered {} nodes", contacts.len());
//!
//!     dht.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
mod contact;
pub mod dht;
pub mod error;
pub mod info_hash;
mod krpc_socket;
mod lookup;
pub mod message;
pub mod node_id;
mod peer_store;
mod routing_table;
mod token;
mod transaction;

// Re-export main types for convenience
pub use config::{DEFAULT_BOOTSTRAP_NODES, DhtConfig};
pub use contact::{Contact, ContactStatus};
pub use dht::{Dht, FindNodeReply, GetPeersReply};
pub use error::DhtError;
pub use info_hash::InfoHash;
pub use lookup::LookupResult;
pub use message::CompactNodeInfo;
pub use node_id::NodeId;
