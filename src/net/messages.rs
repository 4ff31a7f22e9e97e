//! Wire message types exchanged with other peers

use crate::strategy::SearchQuery;
use crate::PeerId;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Membership change announcements. Ring changes propagate as explicit
/// outbound messages through the transport collaborator, never as shared
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// A peer has joined the network
    Join { peer: PeerId },

    /// A peer has left (or is leaving) the network
    Leave { peer: PeerId },

    /// Periodic exchange of the full known-peer list
    PeerList { peers: Vec<PeerId> },
}

/// A flooding-search probe. Receivers deduplicate by `query_id` and
/// forward with a decremented TTL only on first receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodRequest {
    pub query_id: Uuid,
    pub ttl: u32,
    pub origin: PeerId,
    pub query: SearchQuery,
}

impl FloodRequest {
    pub fn new(origin: PeerId, query: SearchQuery, ttl: u32) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            ttl,
            origin,
            query,
        }
    }

    /// The request to pass along to the next hop.
    pub fn forwarded(&self) -> Self {
        Self {
            query_id: self.query_id,
            ttl: self.ttl.saturating_sub(1),
            origin: self.origin.clone(),
            query: self.query.clone(),
        }
    }
}
