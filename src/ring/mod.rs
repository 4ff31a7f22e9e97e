//! Consistent-Hashing Ring - placement authority
//!
//! Maps chunk hashes and manifest keys to an ordered list of responsible
//! peers. Virtual-node tokens smooth the load distribution so that a
//! membership change only moves the keys on the arcs adjacent to the
//! affected peer's tokens.

mod hash_ring;

pub use hash_ring::{ring_position, ConsistentHashRing};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RingError {
    #[error("No peers available on the ring")]
    NoPeersAvailable,
}
