//! Announce tokens (BEP-0005).
//!
//! A token is `hash(requester ip, secret)`, so validity is recomputed on the
//! way back in and nothing is stored per requester. The secret rotates every
//! five minutes and the previous secret stays valid, giving every token a
//! lifetime of at least one full rotation window.

use bytes::Bytes;
use rand::Rng;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

const ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SECRET_LEN: usize = 20;
pub const TOKEN_LEN: usize = 8;

#[derive(Debug)]
pub struct TokenManager {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
    rotated_at: Instant,
}

impl TokenManager {
    pub fn new() -> Self {
        TokenManager {
            current: random_secret(),
            previous: random_secret(),
            rotated_at: Instant::now(),
        }
    }

    /// Token handed out with every get_peers response.
    pub fn mint(&self, ip: &Ipv4Addr) -> Bytes {
        Bytes::copy_from_slice(&compute_token(ip, &self.current))
    }

    /// Accepts tokens minted from the current or the previous secret. The
    /// ip must be the one the token was minted for.
    pub fn verify(&self, ip: &Ipv4Addr, token: &[u8]) -> bool {
        token == compute_token(ip, &self.current)
            || token == compute_token(ip, &self.previous)
    }

    /// Driven from the node actor's tick.
    pub fn rotate_if_due(&mut self) {
        if self.rotated_at.elapsed() >= ROTATION_INTERVAL {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = random_secret();
        self.rotated_at = Instant::now();
        tracing::debug!("rotated announce token secret");
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::rng().fill(&mut secret);
    secret
}

/// Tokens only have to be consistent within this process, so the std
/// SipHash hasher is enough; there is no cross-node verification.
fn compute_token(ip: &Ipv4Addr, secret: &[u8; SECRET_LEN]) -> [u8; TOKEN_LEN] {
    let mut hasher = DefaultHasher::new();
    ip.octets().hash(&mut hasher);
    secret.hash(&mut hasher);
    hasher.finish().to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_bound_to_the_requester_ip() {
        let manager = TokenManager::new();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let token = manager.mint(&ip);
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(manager.verify(&ip, &token));
        assert!(!manager.verify(&Ipv4Addr::new(10, 0, 0, 2), &token));
        assert!(!manager.verify(&ip, b"bogus"));
    }

    #[test]
    fn token_survives_one_rotation_but_not_two() {
        let mut manager = TokenManager::new();
        let ip = Ipv4Addr::new(192, 168, 1, 7);
        let token = manager.mint(&ip);

        manager.rotate();
        assert!(manager.verify(&ip, &token));

        manager.rotate();
        assert!(!manager.verify(&ip, &token));
    }

    #[test]
    fn rotation_waits_for_the_interval() {
        let mut manager = TokenManager::new();
        let before = manager.current;
        manager.rotate_if_due();
        assert_eq!(manager.current, before);
    }
}
