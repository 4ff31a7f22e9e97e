//! Content addressing using BLAKE3
//!
//! Chunks are identified solely by the hash of their bytes, which makes
//! storage write-once and replication idempotent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content hash of a chunk (32-byte BLAKE3 digest)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash data and return its content hash
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex encoding, used as the on-disk chunk filename and in manifests
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Base58 encoding (shorter, for logs and display)
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Verify that data matches this hash
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::hash(data) == *self
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_base58())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Split a file's bytes into fixed-size chunks, hashing each one.
/// Returns `(hash, chunk)` pairs in file order.
pub fn split_chunks(data: &[u8], chunk_size: usize) -> Vec<(ContentHash, &[u8])> {
    data.chunks(chunk_size)
        .map(|chunk| (ContentHash::hash(chunk), chunk))
        .collect()
}
