//! Storage for peers announced via announce_peer.
//!
//! Bounded in both dimensions: an LRU over info-hashes caps how many
//! torrents are tracked, and each torrent caps its peer set by evicting the
//! stalest entry. Expiry is lazy; entries past their TTL are dropped
//! whenever their set is touched.

use crate::info_hash::InfoHash;
use lru::LruCache;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_TORRENTS: usize = 16384;
pub const DEFAULT_MAX_PEERS_PER_TORRENT: usize = 2048;
/// Announces are refreshed by live swarms far more often than this.
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Default)]
struct PeerSet {
    peers: HashMap<SocketAddrV4, Instant>,
}

impl PeerSet {
    fn prune(&mut self, ttl: Duration) {
        self.peers.retain(|_, announced_at| announced_at.elapsed() < ttl);
    }

    fn oldest(&self) -> Option<SocketAddrV4> {
        self.peers
            .iter()
            .min_by_key(|(_, announced_at)| **announced_at)
            .map(|(addr, _)| *addr)
    }
}

#[derive(Debug)]
pub struct PeerStore {
    torrents: LruCache<InfoHash, PeerSet>,
    max_peers_per_torrent: usize,
    peer_ttl: Duration,
}

impl PeerStore {
    pub fn new(max_torrents: usize, max_peers_per_torrent: usize, peer_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_torrents.max(1)).unwrap_or(NonZeroUsize::MIN);
        PeerStore {
            torrents: LruCache::new(capacity),
            max_peers_per_torrent,
            peer_ttl,
        }
    }

    /// Records an announce. Re-announcing refreshes the peer's timestamp.
    pub fn announce(&mut self, info_hash: InfoHash, peer: SocketAddrV4) {
        let set = self.torrents.get_or_insert_mut(info_hash, PeerSet::default);
        set.prune(self.peer_ttl);
        if !set.peers.contains_key(&peer)
            && set.peers.len() >= self.max_peers_per_torrent
            && let Some(oldest) = set.oldest()
        {
            set.peers.remove(&oldest);
        }
        set.peers.insert(peer, Instant::now());
    }

    /// Peers currently announced for `info_hash`, pruning expired entries
    /// on the way.
    pub fn peers_for(&mut self, info_hash: &InfoHash) -> Vec<SocketAddrV4> {
        let Some(set) = self.torrents.get_mut(info_hash) else {
            return Vec::new();
        };
        set.prune(self.peer_ttl);
        if set.peers.is_empty() {
            self.torrents.pop(info_hash);
            return Vec::new();
        }
        set.peers.keys().copied().collect()
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread::sleep;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    fn peer(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    fn store(ttl: Duration) -> PeerStore {
        PeerStore::new(4, 4, ttl)
    }

    #[test]
    fn announced_peers_come_back() {
        let mut store = store(DEFAULT_PEER_TTL);
        store.announce(hash(1), peer(1000));
        store.announce(hash(1), peer(1001));
        let mut peers = store.peers_for(&hash(1));
        peers.sort();
        assert_eq!(peers, vec![peer(1000), peer(1001)]);
        assert!(store.peers_for(&hash(2)).is_empty());
    }

    #[test]
    fn reannounce_does_not_duplicate() {
        let mut store = store(DEFAULT_PEER_TTL);
        store.announce(hash(1), peer(1000));
        store.announce(hash(1), peer(1000));
        assert_eq!(store.peers_for(&hash(1)).len(), 1);
    }

    #[test]
    fn expired_peers_are_pruned_on_read() {
        let mut store = store(Duration::from_millis(5));
        store.announce(hash(1), peer(1000));
        sleep(Duration::from_millis(10));
        assert!(store.peers_for(&hash(1)).is_empty());
        assert_eq!(store.torrent_count(), 0);
    }

    #[test]
    fn full_peer_set_evicts_the_stalest_entry() {
        let mut store = PeerStore::new(4, 2, DEFAULT_PEER_TTL);
        store.announce(hash(1), peer(1000));
        sleep(Duration::from_millis(2));
        store.announce(hash(1), peer(1001));
        sleep(Duration::from_millis(2));
        store.announce(hash(1), peer(1002));

        let mut peers = store.peers_for(&hash(1));
        peers.sort();
        assert_eq!(peers, vec![peer(1001), peer(1002)]);
    }

    #[test]
    fn torrent_capacity_is_an_lru() {
        let mut store = PeerStore::new(1, 4, DEFAULT_PEER_TTL);
        store.announce(hash(1), peer(1000));
        store.announce(hash(2), peer(2000));
        assert!(store.peers_for(&hash(1)).is_empty());
        assert_eq!(store.peers_for(&hash(2)), vec![peer(2000)]);
    }
}
