//! Registered peers and their sequence state
//!
//! Written by the caller thread (add/remove) while the receive thread looks
//! peers up and iterates them for keepalives, so the set lives in a
//! concurrent map and iteration works on a snapshot.

use dashmap::DashMap;
use std::net::SocketAddr;

use crate::network::sequence::SequenceState;

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<SocketAddr, SequenceState>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr`; returns false if it was already present (its state is kept)
    pub fn add(&self, addr: SocketAddr) -> bool {
        let mut added = false;
        self.peers.entry(addr).or_insert_with(|| {
            added = true;
            SequenceState::default()
        });
        added
    }

    /// Unregister `addr`; returns false if it was not present
    pub fn remove(&self, addr: &SocketAddr) -> bool {
        self.peers.remove(addr).is_some()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Point-in-time copy of the registered addresses
    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Extend `wire` for `addr`, or `None` if the peer is not registered
    pub fn update_sequence(&self, addr: &SocketAddr, wire: u16) -> Option<u32> {
        self.peers.get_mut(addr).map(|mut state| state.update(wire))
    }

    /// Current extended sequence of `addr`
    pub fn sequence(&self, addr: &SocketAddr) -> Option<u32> {
        self.peers.get(addr).map(|state| state.extended())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_remove() {
        let registry = PeerRegistry::new();
        assert!(registry.add(addr(1000)));
        assert!(!registry.add(addr(1000)));
        assert!(registry.contains(&addr(1000)));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(&addr(1000)));
        assert!(!registry.remove(&addr(1000)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_readd_keeps_sequence() {
        let registry = PeerRegistry::new();
        registry.add(addr(1));
        assert_eq!(registry.update_sequence(&addr(1), 42), Some(42));
        registry.add(addr(1));
        assert_eq!(registry.sequence(&addr(1)), Some(42));
    }

    #[test]
    fn test_unknown_peer_has_no_sequence() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.update_sequence(&addr(7), 1), None);
    }

    #[test]
    fn test_snapshot() {
        let registry = PeerRegistry::new();
        registry.add(addr(1));
        registry.add(addr(2));
        let mut peers = registry.snapshot();
        peers.sort();
        assert_eq!(peers, vec![addr(1), addr(2)]);
    }
}
