//! Remote-peer collaborator interfaces
//!
//! The transport layer lives outside this crate; the core talks to other
//! peers through the [`PeerClient`] trait and to the cost oracle through
//! [`CostOracle`]. Every remote call is best-effort: bounded retries with
//! a per-call timeout, after which the peer is skipped for the current
//! operation.

mod client;
mod messages;

pub use client::{CostOracle, PeerClient, RetryPolicy};
pub use messages::{FloodRequest, GossipMessage};

use crate::PeerId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },

    #[error("Call to {peer} timed out")]
    Timeout { peer: PeerId },

    #[error("Remote error from {peer}: {reason}")]
    Remote { peer: PeerId, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}
