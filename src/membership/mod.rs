//! Membership - ring membership view and the graceful-departure protocol

mod directory;
mod manager;

pub use directory::PeerDirectory;
pub use manager::{DepartureSummary, MembershipManager, MigrationFailure, PeerState};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("Ring error: {0}")]
    Ring(#[from] crate::ring::RingError),

    #[error("Storage error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("No remaining peers to inherit {0} manifest(s)")]
    Isolated(usize),
}
