//! Local Store - per-peer persistence of chunks and manifests
//!
//! Chunks are content-addressed files, manifests are JSON documents keyed
//! by filename, and index buckets hold the Indexed-Salted strategy's
//! secondary-index entries.

mod content;
mod local_store;
mod manifest;

pub use content::{split_chunks, ContentHash};
pub use local_store::{LocalStore, StoreStats};
pub use manifest::{IndexEntry, Manifest};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("Corrupt manifest rejected: {0}")]
    CorruptManifest(String),

    #[error("Chunk integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
