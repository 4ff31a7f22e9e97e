//! PeerNode - one peer's placement-and-routing engine
//!
//! Wires the immutable configuration into the membership view, the local
//! store, and the active search strategy, and exposes the operations the
//! external transport layer maps requests onto.

use crate::membership::{DepartureSummary, MembershipManager, PeerDirectory, PeerState};
use crate::net::{CostOracle, FloodRequest, GossipMessage, NetError, PeerClient, RetryPolicy};
use crate::store::{split_chunks, ContentHash, IndexEntry, LocalStore, Manifest, StoreStats};
use crate::strategy::{
    local_hits, make_strategy, SearchHit, SearchOutcome, SearchQuery, SearchStrategy,
    StrategyContext,
};
use crate::{PeerConfig, PeerId, Result, SwarmBenchError};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// Result of a successful upload
#[derive(Debug, Clone)]
pub struct StoreReceipt {
    pub manifest: Manifest,

    /// Peers that accepted a manifest replica
    pub replicas: Vec<PeerId>,
}

/// Result of a successful fetch
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub data: Vec<u8>,
    pub manifest: Manifest,
}

pub struct PeerNode {
    config: PeerConfig,
    directory: Arc<PeerDirectory>,
    store: Arc<LocalStore>,
    client: Arc<dyn PeerClient>,
    strategy: Arc<dyn SearchStrategy>,
    membership: MembershipManager,
    retry: RetryPolicy,
}

impl PeerNode {
    /// Build a peer from its configuration and collaborators. The oracle
    /// is only consulted in NetworkAware mode and may be absent.
    pub async fn new(
        config: PeerConfig,
        client: Arc<dyn PeerClient>,
        oracle: Option<Arc<dyn CostOracle>>,
    ) -> Result<Arc<Self>> {
        let directory = Arc::new(PeerDirectory::new(
            config.self_id.clone(),
            &config.known_peers,
            config.virtual_nodes,
        ));

        let store = Arc::new(LocalStore::new(config.data_dir.clone()));
        store.initialize().await.map_err(SwarmBenchError::Store)?;

        let retry = RetryPolicy::from(config.retry);
        let ctx = StrategyContext {
            self_id: config.self_id.clone(),
            directory: directory.clone(),
            store: store.clone(),
            client: client.clone(),
            retry,
            replication_factor: config.replication_factor,
        };
        let strategy = make_strategy(&config.strategy, ctx, oracle);

        let membership = MembershipManager::new(
            directory.clone(),
            store.clone(),
            client.clone(),
            strategy.clone(),
            config.replication_factor,
            RetryPolicy::from(config.departure.retry),
            config.departure.require_clean,
        );

        tracing::info!(
            "Peer {} starting in {} mode ({} known peer(s))",
            config.self_id,
            strategy.name(),
            config.known_peers.len()
        );

        Ok(Arc::new(Self {
            config,
            directory,
            store,
            client,
            strategy,
            membership,
            retry,
        }))
    }

    pub fn self_id(&self) -> &PeerId {
        &self.config.self_id
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn strategy(&self) -> &Arc<dyn SearchStrategy> {
        &self.strategy
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Liveness probe
    pub fn ping(&self) -> PeerState {
        self.membership.state()
    }

    // ---- client operations ------------------------------------------------

    /// Split a local file into chunks, place them on the ring, and ship
    /// the manifest to the strategy's write targets.
    pub async fn store_file(
        &self,
        path: &Path,
        attributes: BTreeMap<String, String>,
    ) -> Result<StoreReceipt> {
        let data = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        self.store_bytes(&filename, &data, attributes).await
    }

    /// Upload already-loaded bytes under the given filename.
    pub async fn store_bytes(
        &self,
        filename: &str,
        data: &[u8],
        attributes: BTreeMap<String, String>,
    ) -> Result<StoreReceipt> {
        let chunks = split_chunks(data, self.config.chunk_size);
        let mut owners: BTreeSet<PeerId> = BTreeSet::new();
        let mut unplaced = Vec::new();

        for (hash, chunk) in &chunks {
            let targets = self
                .directory
                .responsible_for(&hash.to_hex(), self.config.replication_factor)
                .map_err(SwarmBenchError::Ring)?;

            let mut stored = 0usize;
            for target in &targets {
                if *target == self.config.self_id {
                    self.store.put_chunk(hash, chunk).await?;
                    owners.insert(target.clone());
                    stored += 1;
                } else {
                    match self
                        .retry
                        .run(target, "store_chunk", || {
                            self.client.store_chunk(target, hash, chunk)
                        })
                        .await
                    {
                        Ok(()) => {
                            owners.insert(target.clone());
                            stored += 1;
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Chunk {} not replicated to {}: {}",
                                hash.to_base58(),
                                target,
                                e
                            );
                        }
                    }
                }
            }

            if stored == 0 {
                unplaced.push(hash.to_hex());
            }
        }

        if !unplaced.is_empty() {
            return Err(SwarmBenchError::IncompleteFile {
                filename: filename.to_string(),
                missing: unplaced,
            });
        }

        let manifest = Manifest::new(
            filename,
            chunks.iter().map(|(hash, _)| *hash).collect(),
            owners,
            attributes,
            data.len() as u64,
            self.config.chunk_size as u64,
        );

        let targets = self.strategy.write(&manifest).await?;
        let mut replicas = Vec::new();

        for target in &targets {
            if *target == self.config.self_id {
                self.store.put_manifest(&manifest).await?;
                replicas.push(target.clone());
            } else {
                match self
                    .retry
                    .run(target, "store_manifest", || {
                        self.client.store_manifest(target, &manifest)
                    })
                    .await
                {
                    Ok(()) => replicas.push(target.clone()),
                    Err(e) => {
                        tracing::warn!("Manifest '{}' not replicated to {}: {}", filename, target, e)
                    }
                }
            }
        }

        if replicas.is_empty() {
            return Err(SwarmBenchError::Net(NetError::Protocol(format!(
                "manifest '{}' was accepted by no replica",
                filename
            ))));
        }

        tracing::info!(
            "Stored '{}': {} chunk(s), manifest on {:?}",
            filename,
            manifest.chunk_count(),
            replicas
        );

        Ok(StoreReceipt { manifest, replicas })
    }

    /// Resolve a filename to its manifest and reassemble the chunks.
    pub async fn fetch_file(&self, filename: &str) -> Result<FetchedFile> {
        let manifest = self.locate_manifest(filename).await?;
        manifest.validate().map_err(SwarmBenchError::Store)?;

        let mut data = Vec::with_capacity(manifest.total_size as usize);
        let mut missing = Vec::new();

        for hash in manifest.chunks() {
            if let Ok(chunk) = self.store.get_chunk(&hash).await {
                data.extend_from_slice(&chunk);
                continue;
            }

            match self.fetch_chunk_from_owners(&manifest, &hash).await {
                Some(chunk) => data.extend_from_slice(&chunk),
                None => {
                    tracing::warn!("Chunk {} unavailable from any owner", hash.to_base58());
                    missing.push(hash.to_hex());
                }
            }
        }

        if !missing.is_empty() {
            return Err(SwarmBenchError::IncompleteFile {
                filename: filename.to_string(),
                missing,
            });
        }

        self.announce_possession(&manifest).await;

        tracing::info!(
            "Fetched '{}' ({} bytes, {} chunk(s))",
            filename,
            data.len(),
            manifest.chunk_count()
        );

        Ok(FetchedFile { data, manifest })
    }

    /// Route a query through the active strategy.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchOutcome> {
        Ok(self.strategy.query(query).await?)
    }

    /// Announce this peer to every known neighbor so their rings include
    /// it. Best-effort: the transport layer calls this once at start-up,
    /// and an unreachable neighbor simply learns of us later via gossip.
    pub async fn announce_join(&self) {
        let join = GossipMessage::Join {
            peer: self.config.self_id.clone(),
        };
        for peer in self.directory.neighbors() {
            if let Err(e) = self.client.gossip(&peer, &join).await {
                tracing::debug!("Join announcement to {} failed: {}", peer, e);
            }
        }
    }

    /// Graceful departure; returns the migration summary.
    pub async fn shutdown(&self) -> Result<DepartureSummary> {
        Ok(self.membership.depart().await?)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats().await?)
    }

    // ---- fetch internals --------------------------------------------------

    /// Find the manifest: locally first, then the ring-responsible peers.
    async fn locate_manifest(&self, filename: &str) -> Result<Manifest> {
        if let Ok(manifest) = self.store.get_manifest(filename).await {
            return Ok(manifest);
        }

        let holders = self
            .directory
            .responsible_for(filename, self.config.replication_factor)
            .map_err(SwarmBenchError::Ring)?;

        for holder in holders {
            if holder == self.config.self_id {
                continue;
            }
            match self
                .retry
                .run(&holder, "get_manifest", || {
                    self.client.get_manifest(&holder, filename)
                })
                .await
            {
                Ok(manifest) => return Ok(manifest),
                Err(e) => tracing::debug!("Manifest '{}' not on {}: {}", filename, holder, e),
            }
        }

        Err(SwarmBenchError::Store(
            crate::store::StoreError::ManifestNotFound(filename.to_string()),
        ))
    }

    /// Try each owner, in strategy order, until one serves a chunk that
    /// passes its integrity check. The fetched chunk is persisted locally.
    async fn fetch_chunk_from_owners(
        &self,
        manifest: &Manifest,
        hash: &ContentHash,
    ) -> Option<Vec<u8>> {
        let candidates: Vec<PeerId> = manifest
            .owners
            .iter()
            .filter(|p| **p != self.config.self_id)
            .cloned()
            .collect();
        let ranked = self.strategy.rank_sources(&hash.to_hex(), candidates).await;

        for peer in &ranked {
            match self
                .retry
                .run(peer, "get_chunk", || self.client.get_chunk(peer, hash))
                .await
            {
                Ok(chunk) if hash.verify(&chunk) => {
                    if let Err(e) = self.store.put_chunk(hash, &chunk).await {
                        tracing::warn!("Could not persist fetched chunk: {}", e);
                    }
                    return Some(chunk);
                }
                Ok(_) => {
                    tracing::warn!(
                        "Chunk {} from {} failed its integrity check; trying next owner",
                        hash.to_base58(),
                        peer
                    );
                }
                Err(e) => {
                    tracing::debug!("Chunk {} not served by {}: {}", hash.to_base58(), peer, e)
                }
            }
        }

        None
    }

    /// Best-effort: tell the manifest holders this peer now has the file.
    async fn announce_possession(&self, manifest: &Manifest) {
        let holders = match self
            .directory
            .responsible_for(&manifest.filename, self.config.replication_factor)
        {
            Ok(holders) => holders,
            Err(_) => return,
        };

        for holder in holders {
            let result = if holder == self.config.self_id {
                self.store
                    .update_manifest(&manifest.filename, &self.config.self_id)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            } else {
                self.client
                    .update_manifest(&holder, &manifest.filename, &self.config.self_id)
                    .await
                    .map_err(|e| e.to_string())
            };

            if let Err(reason) = result {
                tracing::debug!(
                    "Owner update for '{}' on {} skipped: {}",
                    manifest.filename,
                    holder,
                    reason
                );
            }
        }
    }

    // ---- inbound handlers (wrapped by the transport layer) ---------------

    /// Accept a chunk pushed from another peer. The hash is computed here,
    /// never trusted from the sender.
    pub async fn handle_store_chunk(&self, data: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::hash(data);
        self.store.put_chunk(&hash, data).await?;
        Ok(hash)
    }

    pub async fn handle_get_chunk(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        Ok(self.store.get_chunk(hash).await?)
    }

    /// Accept a manifest pushed from another peer. Malformed manifests are
    /// rejected outright.
    pub async fn handle_store_manifest(&self, manifest: Manifest) -> Result<()> {
        if let Err(e) = manifest.validate() {
            tracing::error!("Rejected corrupt manifest: {}", e);
            return Err(SwarmBenchError::Store(e));
        }
        Ok(self.store.put_manifest(&manifest).await?)
    }

    pub async fn handle_get_manifest(&self, filename: &str) -> Result<Manifest> {
        Ok(self.store.get_manifest(filename).await?)
    }

    pub async fn handle_update_manifest(
        &self,
        filename: &str,
        new_owner: &PeerId,
    ) -> Result<Manifest> {
        Ok(self.store.update_manifest(filename, new_owner).await?)
    }

    /// Search only this peer's disk (the flooding/partition probe target).
    pub async fn handle_search_local(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        Ok(local_hits(self.strategy.context(), query).await?)
    }

    pub async fn handle_flood(&self, request: &FloodRequest) -> Result<SearchOutcome> {
        Ok(self.strategy.handle_flood(request).await?)
    }

    pub async fn handle_index_put(&self, key: &str, entry: IndexEntry) -> Result<()> {
        Ok(self.store.put_index_entry(key, entry).await?)
    }

    pub async fn handle_index_get(&self, key: &str) -> Result<Vec<IndexEntry>> {
        Ok(self.store.get_index_entries(key).await?)
    }

    pub fn handle_gossip(&self, message: &GossipMessage) {
        self.membership.handle_gossip(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::build_cluster;
    use crate::StrategyConfig;

    fn flooding() -> StrategyConfig {
        StrategyConfig::Flooding { ttl: 2, fanout: 0 }
    }

    #[tokio::test]
    async fn test_store_and_fetch_roundtrip() {
        let cluster = build_cluster(
            &["peerA:5000", "peerB:5000", "peerC:5000"],
            flooding(),
            2,
        )
        .await;

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        cluster
            .node("peerA:5000")
            .store_bytes("big.bin", &payload, BTreeMap::new())
            .await
            .unwrap();

        // A different peer resolves the manifest and reassembles the file.
        let fetched = cluster.node("peerB:5000").fetch_file("big.bin").await.unwrap();
        assert_eq!(fetched.data, payload);
        assert_eq!(fetched.manifest.filename, "big.bin");
    }

    #[tokio::test]
    async fn test_store_file_reads_from_disk() {
        let cluster = build_cluster(&["peerA:5000", "peerB:5000"], flooding(), 2).await;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"file on local disk").await.unwrap();

        let receipt = cluster
            .node("peerA:5000")
            .store_file(&path, BTreeMap::new())
            .await
            .unwrap();

        // The manifest is keyed by the file's name, not its path.
        assert_eq!(receipt.manifest.filename, "notes.txt");
        assert_eq!(receipt.manifest.total_size, 18);

        let fetched = cluster.node("peerB:5000").fetch_file("notes.txt").await.unwrap();
        assert_eq!(fetched.data, b"file on local disk");
    }

    #[tokio::test]
    async fn test_chunks_replicated_to_r_peers() {
        let cluster = build_cluster(
            &["peerA:5000", "peerB:5000", "peerC:5000"],
            flooding(),
            2,
        )
        .await;

        let receipt = cluster
            .node("peerA:5000")
            .store_bytes("file.txt", b"replicated payload", BTreeMap::new())
            .await
            .unwrap();

        let hash = receipt.manifest.chunks().next().unwrap();
        let holding = futures::future::join_all(
            ["peerA:5000", "peerB:5000", "peerC:5000"]
                .iter()
                .map(|p| async { cluster.store_of(p).has_chunk(&hash).await }),
        )
        .await;

        assert_eq!(holding.iter().filter(|h| **h).count(), 2);
        assert_eq!(receipt.manifest.owners.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_unknown_file_is_not_found() {
        let cluster = build_cluster(&["peerA:5000", "peerB:5000"], flooding(), 2).await;

        let result = cluster.node("peerA:5000").fetch_file("nope.txt").await;
        assert!(matches!(
            result,
            Err(SwarmBenchError::Store(
                crate::store::StoreError::ManifestNotFound(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_fetch_appends_self_to_owner_set() {
        let cluster = build_cluster(
            &["peerA:5000", "peerB:5000", "peerC:5000"],
            flooding(),
            1,
        )
        .await;

        cluster
            .node("peerA:5000")
            .store_bytes("doc.txt", b"contents", BTreeMap::new())
            .await
            .unwrap();

        cluster.node("peerB:5000").fetch_file("doc.txt").await.unwrap();

        // The manifest holder now lists peerB as an owner.
        let manifest = cluster
            .node("peerB:5000")
            .fetch_file("doc.txt")
            .await
            .unwrap()
            .manifest;
        assert!(manifest.owners.contains(&PeerId::from("peerB:5000")));
    }

    #[tokio::test]
    async fn test_upload_survives_one_down_replica() {
        let cluster = build_cluster(
            &["peerA:5000", "peerB:5000", "peerC:5000"],
            flooding(),
            3,
        )
        .await;

        cluster.client.take_down("peerC:5000");

        let receipt = cluster
            .node("peerA:5000")
            .store_bytes("resilient.txt", b"still stored", BTreeMap::new())
            .await
            .unwrap();

        // The unreachable peer is skipped, the upload still succeeds.
        assert!(!receipt.replicas.contains(&PeerId::from("peerC:5000")));
        assert!(!receipt.replicas.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_rejected_on_receipt() {
        let cluster = build_cluster(&["peerA:5000"], flooding(), 1).await;
        let node = cluster.node("peerA:5000");

        let mut manifest = node
            .store_bytes("ok.txt", b"fine", BTreeMap::new())
            .await
            .unwrap()
            .manifest;
        manifest.chunk_hashes[0] = "garbage".to_string();
        manifest.filename = "evil.txt".to_string();

        assert!(node.handle_store_manifest(manifest).await.is_err());
        assert!(node.handle_get_manifest("evil.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_handle_store_chunk_hashes_server_side() {
        let cluster = build_cluster(&["peerA:5000"], flooding(), 1).await;
        let node = cluster.node("peerA:5000");

        let hash = node.handle_store_chunk(b"pushed chunk").await.unwrap();
        assert_eq!(hash, ContentHash::hash(b"pushed chunk"));
        assert_eq!(node.handle_get_chunk(&hash).await.unwrap(), b"pushed chunk");
    }

    #[tokio::test]
    async fn test_ping_reports_state() {
        let cluster = build_cluster(&["peerA:5000", "peerB:5000"], flooding(), 1).await;
        assert_eq!(cluster.node("peerA:5000").ping(), PeerState::Active);
    }

    #[tokio::test]
    async fn test_fetch_reports_missing_chunk_hashes() {
        let cluster = build_cluster(&["peerA:5000", "peerB:5000"], flooding(), 1).await;
        let node_a = cluster.node("peerA:5000");
        let peer_a = PeerId::from("peerA:5000");
        let peer_b = PeerId::from("peerB:5000");

        // Find a payload whose single chunk replica lands on peerB while
        // the manifest lands on peerA, so losing peerB strands the chunk.
        let mut found = None;
        for i in 0..200 {
            let filename = format!("frail-{}.bin", i);
            let payload = format!("payload-{}", i).into_bytes();
            let hash = ContentHash::hash(&payload);

            let chunk_owner = node_a.directory().primary_for(&hash.to_hex()).unwrap();
            let manifest_owner = node_a.directory().primary_for(&filename).unwrap();
            if chunk_owner == peer_b && manifest_owner == peer_a {
                found = Some((filename, payload, hash));
                break;
            }
        }
        let (filename, payload, hash) = found.unwrap();

        node_a
            .store_bytes(&filename, &payload, BTreeMap::new())
            .await
            .unwrap();
        cluster.client.take_down("peerB:5000");

        let result = node_a.fetch_file(&filename).await;
        match result {
            Err(SwarmBenchError::IncompleteFile { missing, .. }) => {
                assert_eq!(missing, vec![hash.to_hex()]);
            }
            other => panic!("expected IncompleteFile, got {:?}", other.map(|f| f.manifest)),
        }
    }

    #[tokio::test]
    async fn test_announce_join_spreads_membership() {
        let cluster = build_cluster(&["peerA:5000", "peerB:5000"], flooding(), 1).await;
        let node_a = cluster.node("peerA:5000");
        let peer_b = PeerId::from("peerB:5000");

        // peerA has somehow lost track of peerB.
        node_a.directory().remove_peer(&peer_b);
        assert!(!node_a.directory().contains(&peer_b));

        cluster.node("peerB:5000").announce_join().await;
        assert!(node_a.directory().contains(&peer_b));
    }
}
