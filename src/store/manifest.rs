//! Manifest - metadata record describing a distributed file

use super::{ContentHash, StoreError};
use crate::PeerId;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Metadata for one distributed file: its ordered chunk hashes, the peers
/// known to hold a copy, and the semantic attributes used by the
/// Partitioned strategy. The owner set grows as peers fetch the file and
/// shrinks only through redistribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Original filename (the manifest's lookup key)
    pub filename: String,

    /// Chunk content hashes in file order (hex)
    pub chunk_hashes: Vec<String>,

    /// Peers currently holding the file's chunks
    pub owners: BTreeSet<PeerId>,

    /// Semantic attributes (e.g. genre -> value)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Original file size in bytes
    pub total_size: u64,

    /// Chunk size the file was split with
    pub chunk_size: u64,

    /// Last-writer-wins timestamp (Unix seconds)
    pub updated_at: i64,
}

impl Manifest {
    pub fn new(
        filename: impl Into<String>,
        chunk_hashes: Vec<ContentHash>,
        owners: BTreeSet<PeerId>,
        attributes: BTreeMap<String, String>,
        total_size: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            chunk_hashes: chunk_hashes.iter().map(ContentHash::to_hex).collect(),
            owners,
            attributes,
            total_size,
            chunk_size,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Structural validation applied before a received manifest is stored.
    /// A manifest that fails here is rejected outright.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.filename.is_empty() {
            return Err(StoreError::CorruptManifest("empty filename".into()));
        }
        if self.chunk_hashes.is_empty() {
            return Err(StoreError::CorruptManifest(format!(
                "manifest '{}' lists no chunks",
                self.filename
            )));
        }
        for hash in &self.chunk_hashes {
            if ContentHash::from_hex(hash).is_err() {
                return Err(StoreError::CorruptManifest(format!(
                    "manifest '{}' carries malformed chunk hash '{}'",
                    self.filename, hash
                )));
            }
        }
        Ok(())
    }

    /// Parsed chunk hashes, in file order.
    pub fn chunks(&self) -> impl Iterator<Item = ContentHash> + '_ {
        self.chunk_hashes
            .iter()
            .filter_map(|h| ContentHash::from_hex(h).ok())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }
}

/// One record in a salted secondary-index bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Manifest identifier
    pub filename: String,

    /// Attributes copied from the manifest (for result display/filtering)
    pub attributes: BTreeMap<String, String>,

    /// Peer that performed the indexed write
    pub host: PeerId,
}
