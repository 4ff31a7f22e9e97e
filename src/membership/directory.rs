//! Shared membership view: the known-peer set and the hash ring

use crate::ring::{ConsistentHashRing, RingError};
use crate::PeerId;

use parking_lot::RwLock;
use std::collections::BTreeSet;

/// The peer's view of ring membership.
///
/// Lookups take a read lock and may run concurrently; membership changes
/// take the write lock, keeping ring mutation mutually exclusive against
/// lookups in a narrow critical section.
pub struct PeerDirectory {
    self_id: PeerId,
    peers: RwLock<BTreeSet<PeerId>>,
    ring: RwLock<ConsistentHashRing>,
}

impl PeerDirectory {
    /// Seed the view with the peers known at start-up plus self.
    pub fn new(self_id: PeerId, known_peers: &[PeerId], virtual_nodes: usize) -> Self {
        let mut peers: BTreeSet<PeerId> = known_peers.iter().cloned().collect();
        peers.insert(self_id.clone());

        let ring = ConsistentHashRing::with_peers(virtual_nodes, peers.iter());

        Self {
            self_id,
            peers: RwLock::new(peers),
            ring: RwLock::new(ring),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Every known peer except self.
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .iter()
            .filter(|p| **p != self.self_id)
            .cloned()
            .collect()
    }

    pub fn all_peers(&self) -> Vec<PeerId> {
        self.peers.read().iter().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().contains(peer)
    }

    /// Add one peer. Returns false when it was already known.
    pub fn add_peer(&self, peer: &PeerId) -> bool {
        let mut peers = self.peers.write();
        if !peers.insert(peer.clone()) {
            return false;
        }
        self.ring.write().add_node(peer);
        tracing::info!("Peer {} joined; {} peers known", peer, peers.len());
        true
    }

    /// Remove one peer. Returns false when it was not known.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let mut peers = self.peers.write();
        if !peers.remove(peer) {
            return false;
        }
        self.ring.write().remove_node(peer);
        tracing::info!("Peer {} removed; {} peers known", peer, peers.len());
        true
    }

    /// Merge a gossiped peer list, returning the newly learned peers.
    pub fn merge_peers(&self, incoming: &[PeerId]) -> Vec<PeerId> {
        incoming
            .iter()
            .filter(|peer| self.add_peer(peer))
            .cloned()
            .collect()
    }

    pub fn responsible_for(
        &self,
        key: &str,
        replication_factor: usize,
    ) -> Result<Vec<PeerId>, RingError> {
        self.ring.read().responsible_for(key, replication_factor)
    }

    pub fn responsible_for_excluding(
        &self,
        key: &str,
        replication_factor: usize,
        excluded: &PeerId,
    ) -> Result<Vec<PeerId>, RingError> {
        self.ring
            .read()
            .responsible_for_excluding(key, replication_factor, excluded)
    }

    pub fn primary_for(&self, key: &str) -> Result<PeerId, RingError> {
        self.ring.read().primary_for(key)
    }
}
