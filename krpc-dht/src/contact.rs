use crate::node_id::NodeId;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// A contact stops counting as alive this long after its last response.
pub const ALIVE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// BEP-0005 node states: good nodes have answered us recently, questionable
/// ones were discovered but never verified (or have gone quiet), bad ones
/// failed their last queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    Good,
    Questionable,
    Bad,
}

/// A remote node as the routing table sees it.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddrV4,
    /// Address this node reported seeing us at (the `ip` key of its
    /// responses), when it sent one.
    pub reported_ip: Option<SocketAddrV4>,
    pub last_seen: Instant,
    pub status: ContactStatus,
}

impl Contact {
    /// A discovered but unverified contact.
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Contact {
            id,
            addr,
            reported_ip: None,
            last_seen: Instant::now(),
            status: ContactStatus::Questionable,
        }
    }

    /// A contact that just answered one of our queries.
    pub fn alive(id: NodeId, addr: SocketAddrV4) -> Self {
        Contact {
            id,
            addr,
            reported_ip: None,
            last_seen: Instant::now(),
            status: ContactStatus::Good,
        }
    }

    pub fn mark_alive(&mut self) {
        self.status = ContactStatus::Good;
        self.last_seen = Instant::now();
    }

    pub fn mark_bad(&mut self) {
        self.status = ContactStatus::Bad;
    }

    /// Answered a query within the freshness window.
    pub fn is_alive(&self) -> bool {
        self.status == ContactStatus::Good && self.last_seen.elapsed() < ALIVE_WINDOW
    }
}
