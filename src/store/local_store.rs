//! Filesystem-backed store for chunks, manifests, and index buckets

use super::{ContentHash, IndexEntry, Manifest, StoreError};
use crate::PeerId;

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-peer local persistence.
///
/// Chunks are write-once files named by their content hash. Manifests are
/// JSON documents named by the hash of their filename; every mutation of
/// one manifest serializes through a per-filename lock so concurrent
/// owner-set updates never lose writes. Chunk writes need no such lock:
/// identical content maps to the identical path, so re-writes are no-ops.
pub struct LocalStore {
    data_dir: PathBuf,
    manifest_locks: DashMap<String, Arc<Mutex<()>>>,
    index_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Storage usage, consumed by the benchmark orchestrator
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub chunk_count: u64,
    pub chunk_bytes: u64,
    pub manifest_count: u64,
    pub index_count: u64,
}

impl LocalStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            manifest_locks: DashMap::new(),
            index_locks: DashMap::new(),
        }
    }

    /// Create the on-disk layout. Must run before any other operation.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        for dir in ["chunks", "manifests", "index"] {
            tokio::fs::create_dir_all(self.data_dir.join(dir)).await?;
        }
        Ok(())
    }

    fn chunk_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.data_dir.join("chunks").join(&hex[..2]).join(&hex)
    }

    fn manifest_path(&self, filename: &str) -> PathBuf {
        let key = hex::encode(blake3::hash(filename.as_bytes()).as_bytes());
        self.data_dir
            .join("manifests")
            .join(format!("{}.manifest.json", key))
    }

    fn index_path(&self, key: &str) -> PathBuf {
        let name = hex::encode(blake3::hash(key.as_bytes()).as_bytes());
        self.data_dir.join("index").join(format!("{}.json", name))
    }

    fn manifest_lock(&self, filename: &str) -> Arc<Mutex<()>> {
        self.manifest_locks
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn index_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.index_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ---- chunks -----------------------------------------------------------

    /// Store a chunk. Content-addressed and write-once: storing a chunk
    /// that already exists is an idempotent no-op.
    pub async fn put_chunk(&self, hash: &ContentHash, data: &[u8]) -> Result<(), StoreError> {
        let path = self.chunk_path(hash);

        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic create: write to a unique temp file, then rename into place.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("Stored chunk {} ({} bytes)", hash.to_base58(), data.len());
        Ok(())
    }

    /// Load a chunk, re-verifying its content hash on the way out.
    pub async fn get_chunk(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
        let path = self.chunk_path(hash);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ChunkNotFound(hash.to_hex()));
            }
            Err(e) => return Err(e.into()),
        };

        if !hash.verify(&data) {
            return Err(StoreError::IntegrityCheckFailed(hash.to_hex()));
        }

        Ok(data)
    }

    pub async fn has_chunk(&self, hash: &ContentHash) -> bool {
        tokio::fs::try_exists(self.chunk_path(hash))
            .await
            .unwrap_or(false)
    }

    // ---- manifests --------------------------------------------------------

    /// Store a manifest, validating it first. Malformed manifests are
    /// rejected and never written.
    pub async fn put_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        manifest.validate()?;

        let lock = self.manifest_lock(&manifest.filename);
        let _guard = lock.lock().await;

        self.write_manifest(manifest).await?;
        tracing::debug!(
            "Stored manifest '{}' ({} chunks)",
            manifest.filename,
            manifest.chunk_count()
        );
        Ok(())
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::write(self.manifest_path(&manifest.filename), json).await?;
        Ok(())
    }

    pub async fn get_manifest(&self, filename: &str) -> Result<Manifest, StoreError> {
        let path = self.manifest_path(filename);

        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ManifestNotFound(filename.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub async fn has_manifest(&self, filename: &str) -> bool {
        tokio::fs::try_exists(self.manifest_path(filename))
            .await
            .unwrap_or(false)
    }

    /// Append a peer to a manifest's owner set. Rejects when the manifest
    /// is not held locally; adding an existing owner is a no-op.
    pub async fn update_manifest(
        &self,
        filename: &str,
        new_owner: &PeerId,
    ) -> Result<Manifest, StoreError> {
        let lock = self.manifest_lock(filename);
        let _guard = lock.lock().await;

        let mut manifest = self.get_manifest(filename).await?;

        if manifest.owners.insert(new_owner.clone()) {
            manifest.updated_at = chrono::Utc::now().timestamp();
            self.write_manifest(&manifest).await?;
            tracing::debug!("Manifest '{}' gained owner {}", filename, new_owner);
        }

        Ok(manifest)
    }

    /// All locally held manifests. Used by the departure scan and local
    /// search; files that fail to parse are logged and skipped.
    pub async fn list_manifests(&self) -> Result<Vec<Manifest>, StoreError> {
        let mut manifests = Vec::new();
        let mut entries = tokio::fs::read_dir(self.data_dir.join("manifests")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(".manifest.json") {
                continue;
            }

            let json = tokio::fs::read_to_string(entry.path()).await?;
            match serde_json::from_str::<Manifest>(&json) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => {
                    tracing::error!("Skipping unreadable manifest {:?}: {}", name, e);
                }
            }
        }

        Ok(manifests)
    }

    pub async fn delete_manifest(&self, filename: &str) -> Result<(), StoreError> {
        let lock = self.manifest_lock(filename);
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(self.manifest_path(filename)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---- secondary-index buckets -----------------------------------------

    /// Append an entry to a salted index bucket, deduplicating by filename.
    pub async fn put_index_entry(&self, key: &str, entry: IndexEntry) -> Result<(), StoreError> {
        let lock = self.index_lock(key);
        let _guard = lock.lock().await;

        let mut entries = self.read_index(key).await?;
        if entries.iter().any(|e| e.filename == entry.filename) {
            return Ok(());
        }
        entries.push(entry);

        let json = serde_json::to_string(&entries)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::write(self.index_path(key), json).await?;
        Ok(())
    }

    /// Entries of one salted index bucket; empty when the bucket is absent.
    pub async fn get_index_entries(&self, key: &str) -> Result<Vec<IndexEntry>, StoreError> {
        self.read_index(key).await
    }

    async fn read_index(&self, key: &str) -> Result<Vec<IndexEntry>, StoreError> {
        match tokio::fs::read_to_string(self.index_path(key)).await {
            Ok(json) => {
                serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    // ---- stats ------------------------------------------------------------

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();

        let mut prefixes = tokio::fs::read_dir(self.data_dir.join("chunks")).await?;
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut chunks = tokio::fs::read_dir(prefix.path()).await?;
            while let Some(chunk) = chunks.next_entry().await? {
                stats.chunk_count += 1;
                stats.chunk_bytes += chunk.metadata().await?.len();
            }
        }

        let mut manifests = tokio::fs::read_dir(self.data_dir.join("manifests")).await?;
        while manifests.next_entry().await?.is_some() {
            stats.manifest_count += 1;
        }

        let mut index = tokio::fs::read_dir(self.data_dir.join("index")).await?;
        while index.next_entry().await?.is_some() {
            stats.index_count += 1;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    async fn open_store(dir: &TempDir) -> LocalStore {
        let store = LocalStore::new(dir.path().to_path_buf());
        store.initialize().await.unwrap();
        store
    }

    fn sample_manifest(filename: &str) -> Manifest {
        Manifest::new(
            filename,
            vec![ContentHash::hash(b"c0"), ContentHash::hash(b"c1")],
            BTreeSet::from([PeerId::from("peer1:5000")]),
            BTreeMap::from([("genre".to_string(), "jazz".to_string())]),
            2048,
            1024,
        )
    }

    #[tokio::test]
    async fn test_chunk_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let data = b"chunk payload";
        let hash = ContentHash::hash(data);

        store.put_chunk(&hash, data).await.unwrap();
        assert!(store.has_chunk(&hash).await);
        assert_eq!(store.get_chunk(&hash).await.unwrap(), data.to_vec());

        // Write-once: storing the same content again is a no-op.
        store.put_chunk(&hash, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_chunk_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let missing = ContentHash::hash(b"never stored");
        assert!(matches!(
            store.get_chunk(&missing).await,
            Err(StoreError::ChunkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_integrity_verified_on_read() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let hash = ContentHash::hash(b"original");
        store.put_chunk(&hash, b"original").await.unwrap();

        // Corrupt the file behind the store's back.
        tokio::fs::write(store.chunk_path(&hash), b"tampered")
            .await
            .unwrap();

        assert!(matches!(
            store.get_chunk(&hash).await,
            Err(StoreError::IntegrityCheckFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let manifest = sample_manifest("song.flac");
        store.put_manifest(&manifest).await.unwrap();

        let loaded = store.get_manifest("song.flac").await.unwrap();
        assert_eq!(loaded.chunk_hashes, manifest.chunk_hashes);

        assert!(matches!(
            store.get_manifest("absent.txt").await,
            Err(StoreError::ManifestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let mut manifest = sample_manifest("bad.bin");
        manifest.chunk_hashes[0] = "zzzz".to_string();

        assert!(matches!(
            store.put_manifest(&manifest).await,
            Err(StoreError::CorruptManifest(_))
        ));
        assert!(!store.has_manifest("bad.bin").await);
    }

    #[tokio::test]
    async fn test_update_manifest_appends_owner() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put_manifest(&sample_manifest("film.mkv")).await.unwrap();

        let updated = store
            .update_manifest("film.mkv", &PeerId::from("peer2:5000"))
            .await
            .unwrap();
        assert_eq!(updated.owners.len(), 2);

        // Re-adding the same owner changes nothing.
        let again = store
            .update_manifest("film.mkv", &PeerId::from("peer2:5000"))
            .await
            .unwrap();
        assert_eq!(again.owners.len(), 2);
    }

    #[tokio::test]
    async fn test_update_absent_manifest_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        assert!(matches!(
            store
                .update_manifest("ghost.txt", &PeerId::from("peer2:5000"))
                .await,
            Err(StoreError::ManifestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_delete_manifests() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.put_manifest(&sample_manifest("a.txt")).await.unwrap();
        store.put_manifest(&sample_manifest("b.txt")).await.unwrap();
        assert_eq!(store.list_manifests().await.unwrap().len(), 2);

        store.delete_manifest("a.txt").await.unwrap();
        assert_eq!(store.list_manifests().await.unwrap().len(), 1);

        // Deleting an absent manifest is tolerated.
        store.delete_manifest("a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_index_entries_dedupe() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let entry = IndexEntry {
            filename: "doc.pdf".to_string(),
            attributes: BTreeMap::new(),
            host: PeerId::from("peer1:5000"),
        };

        store.put_index_entry("genre:jazz:0", entry.clone()).await.unwrap();
        store.put_index_entry("genre:jazz:0", entry).await.unwrap();

        assert_eq!(store.get_index_entries("genre:jazz:0").await.unwrap().len(), 1);
        assert!(store.get_index_entries("genre:blues:0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let data = b"some chunk";
        store.put_chunk(&ContentHash::hash(data), data).await.unwrap();
        store.put_manifest(&sample_manifest("x.txt")).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.chunk_bytes, data.len() as u64);
        assert_eq!(stats.manifest_count, 1);
        assert_eq!(stats.index_count, 0);
    }
}
