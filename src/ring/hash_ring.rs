//! Ring structure: sorted virtual-node tokens with clockwise walks

use super::RingError;
use crate::PeerId;

use std::collections::BTreeMap;

/// Position of a key on the ring: the first 8 bytes of its BLAKE3 digest,
/// big-endian. Every peer computes placement with this same function, so
/// ownership converges without coordination.
pub fn ring_position(key: &str) -> u64 {
    let digest = blake3::hash(key.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(buf)
}

/// Consistent-hashing ring with virtual nodes.
///
/// Each physical peer owns `virtual_nodes` token positions, obtained by
/// hashing `"{peer}#{i}"`. Keys route to the first token clockwise from
/// their own position, wrapping at the top of the keyspace.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    virtual_nodes: usize,
    tokens: BTreeMap<u64, PeerId>,
}

impl ConsistentHashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes,
            tokens: BTreeMap::new(),
        }
    }

    /// Build a ring already populated with the given peers.
    pub fn with_peers<'a>(virtual_nodes: usize, peers: impl IntoIterator<Item = &'a PeerId>) -> Self {
        let mut ring = Self::new(virtual_nodes);
        for peer in peers {
            ring.add_node(peer);
        }
        ring
    }

    /// Add a physical peer (all of its virtual-node tokens) to the ring.
    /// Re-adding an existing peer is a no-op for its already-placed tokens.
    pub fn add_node(&mut self, peer: &PeerId) {
        for i in 0..self.virtual_nodes {
            let token = ring_position(&format!("{}#{}", peer, i));

            match self.tokens.get(&token) {
                // Token collisions across distinct peers resolve to the
                // first inserter so every peer agrees on the outcome.
                Some(existing) if existing != peer => {
                    tracing::warn!(
                        "Token collision at {} between {} and {}; keeping {}",
                        token,
                        existing,
                        peer,
                        existing
                    );
                }
                Some(_) => {}
                None => {
                    self.tokens.insert(token, peer.clone());
                }
            }
        }
    }

    /// Remove a physical peer (all of its tokens) from the ring.
    pub fn remove_node(&mut self, peer: &PeerId) {
        for i in 0..self.virtual_nodes {
            let token = ring_position(&format!("{}#{}", peer, i));
            if self.tokens.get(&token) == Some(peer) {
                self.tokens.remove(&token);
            }
        }
    }

    /// The ordered list of distinct peers responsible for `key`.
    ///
    /// Walks clockwise from the key's position collecting distinct
    /// physical peers until `replication_factor` are found or the ring is
    /// exhausted; fewer than `replication_factor` peers are returned only
    /// when the ring holds fewer physical peers.
    pub fn responsible_for(
        &self,
        key: &str,
        replication_factor: usize,
    ) -> Result<Vec<PeerId>, RingError> {
        self.walk(key, replication_factor, None)
    }

    /// Like [`responsible_for`](Self::responsible_for), but skipping one
    /// peer. Used by the departure protocol to compute ownership as if the
    /// departing peer were already gone.
    pub fn responsible_for_excluding(
        &self,
        key: &str,
        replication_factor: usize,
        excluded: &PeerId,
    ) -> Result<Vec<PeerId>, RingError> {
        self.walk(key, replication_factor, Some(excluded))
    }

    /// The single primary owner of `key`.
    pub fn primary_for(&self, key: &str) -> Result<PeerId, RingError> {
        self.walk(key, 1, None)
            .map(|mut peers| peers.remove(0))
    }

    fn walk(
        &self,
        key: &str,
        count: usize,
        excluded: Option<&PeerId>,
    ) -> Result<Vec<PeerId>, RingError> {
        if self.tokens.is_empty() {
            return Err(RingError::NoPeersAvailable);
        }

        let position = ring_position(key);
        let mut found = Vec::new();

        // First token clockwise >= position, then wrap to the lowest token.
        let clockwise = self
            .tokens
            .range(position..)
            .chain(self.tokens.range(..position));

        for (_, peer) in clockwise {
            if excluded == Some(peer) || found.contains(peer) {
                continue;
            }
            found.push(peer.clone());
            if found.len() == count {
                break;
            }
        }

        if found.is_empty() {
            // Every token belongs to the excluded peer.
            return Err(RingError::NoPeersAvailable);
        }

        Ok(found)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.tokens.values().any(|p| p == peer)
    }

    /// Number of distinct physical peers on the ring.
    pub fn peer_count(&self) -> usize {
        let mut peers: Vec<&PeerId> = self.tokens.values().collect();
        peers.sort();
        peers.dedup();
        peers.len()
    }

    /// Total virtual-node tokens currently placed.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
