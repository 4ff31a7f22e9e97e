//! In-memory cluster harness: a loopback PeerClient that dispatches
//! directly to peer nodes, so multi-peer protocol behavior runs in tests
//! without a transport layer.

use crate::net::{CostOracle, FloodRequest, GossipMessage, NetError, PeerClient};
use crate::node::PeerNode;
use crate::store::{ContentHash, IndexEntry, LocalStore, Manifest};
use crate::strategy::{SearchHit, SearchOutcome, SearchQuery};
use crate::{DepartureConfig, PeerConfig, PeerId, RetryConfig, StrategyConfig, SwarmBenchError};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestCluster {
    nodes: Arc<DashMap<PeerId, Arc<PeerNode>>>,
    pub client: Arc<LoopbackClient>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    pub fn node(&self, id: &str) -> Arc<PeerNode> {
        self.nodes
            .get(&PeerId::from(id))
            .expect("unknown peer in test cluster")
            .clone()
    }

    pub fn store_of(&self, id: &str) -> Arc<LocalStore> {
        self.node(id).store().clone()
    }
}

/// PeerClient that calls the target node's handlers in-process.
pub struct LoopbackClient {
    nodes: Arc<DashMap<PeerId, Arc<PeerNode>>>,
    down: DashMap<PeerId, ()>,
    floods: AtomicU64,
    searches: AtomicU64,
}

impl LoopbackClient {
    fn target(&self, peer: &PeerId) -> Result<Arc<PeerNode>, NetError> {
        if self.down.contains_key(peer) {
            return Err(NetError::Unreachable {
                peer: peer.clone(),
                reason: "peer is down".to_string(),
            });
        }
        self.nodes
            .get(peer)
            .map(|node| node.clone())
            .ok_or_else(|| NetError::Unreachable {
                peer: peer.clone(),
                reason: "unknown peer".to_string(),
            })
    }

    /// Simulate a peer going dark: every call to it fails as unreachable.
    pub fn take_down(&self, id: &str) {
        self.down.insert(PeerId::from(id), ());
    }

    pub fn bring_up(&self, id: &str) {
        self.down.remove(&PeerId::from(id));
    }

    /// Flood probes delivered (including ones swallowed by dedup).
    pub fn flood_deliveries(&self) -> u64 {
        self.floods.load(Ordering::SeqCst)
    }

    /// Remote search_local calls delivered.
    pub fn search_deliveries(&self) -> u64 {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.floods.store(0, Ordering::SeqCst);
        self.searches.store(0, Ordering::SeqCst);
    }
}

fn remote_err(peer: &PeerId, e: SwarmBenchError) -> NetError {
    NetError::Remote {
        peer: peer.clone(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl PeerClient for LoopbackClient {
    async fn store_chunk(
        &self,
        peer: &PeerId,
        _hash: &ContentHash,
        data: &[u8],
    ) -> Result<(), NetError> {
        self.target(peer)?
            .handle_store_chunk(data)
            .await
            .map(|_| ())
            .map_err(|e| remote_err(peer, e))
    }

    async fn get_chunk(&self, peer: &PeerId, hash: &ContentHash) -> Result<Vec<u8>, NetError> {
        self.target(peer)?
            .handle_get_chunk(hash)
            .await
            .map_err(|e| remote_err(peer, e))
    }

    async fn store_manifest(&self, peer: &PeerId, manifest: &Manifest) -> Result<(), NetError> {
        self.target(peer)?
            .handle_store_manifest(manifest.clone())
            .await
            .map_err(|e| remote_err(peer, e))
    }

    async fn get_manifest(&self, peer: &PeerId, filename: &str) -> Result<Manifest, NetError> {
        self.target(peer)?
            .handle_get_manifest(filename)
            .await
            .map_err(|e| remote_err(peer, e))
    }

    async fn update_manifest(
        &self,
        peer: &PeerId,
        filename: &str,
        new_owner: &PeerId,
    ) -> Result<(), NetError> {
        self.target(peer)?
            .handle_update_manifest(filename, new_owner)
            .await
            .map(|_| ())
            .map_err(|e| remote_err(peer, e))
    }

    async fn search_local(
        &self,
        peer: &PeerId,
        query: &SearchQuery,
    ) -> Result<Vec<SearchHit>, NetError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.target(peer)?
            .handle_search_local(query)
            .await
            .map_err(|e| remote_err(peer, e))
    }

    async fn flood(
        &self,
        peer: &PeerId,
        request: &FloodRequest,
    ) -> Result<SearchOutcome, NetError> {
        self.floods.fetch_add(1, Ordering::SeqCst);
        self.target(peer)?
            .handle_flood(request)
            .await
            .map_err(|e| remote_err(peer, e))
    }

    async fn index_put(
        &self,
        peer: &PeerId,
        key: &str,
        entry: &IndexEntry,
    ) -> Result<(), NetError> {
        self.target(peer)?
            .handle_index_put(key, entry.clone())
            .await
            .map_err(|e| remote_err(peer, e))
    }

    async fn index_get(&self, peer: &PeerId, key: &str) -> Result<Vec<IndexEntry>, NetError> {
        self.target(peer)?
            .handle_index_get(key)
            .await
            .map_err(|e| remote_err(peer, e))
    }

    async fn ping(&self, peer: &PeerId) -> Result<Duration, NetError> {
        self.target(peer)?;
        Ok(Duration::from_millis(1))
    }

    async fn gossip(&self, peer: &PeerId, message: &GossipMessage) -> Result<(), NetError> {
        self.target(peer)?.handle_gossip(message);
        Ok(())
    }
}

/// Fixed-cost oracle for NetworkAware tests.
pub struct StaticOracle {
    costs: HashMap<PeerId, f64>,
    fail: bool,
}

impl StaticOracle {
    pub fn new(costs: &[(&str, f64)]) -> Self {
        Self {
            costs: costs
                .iter()
                .map(|(peer, cost)| (PeerId::from(*peer), *cost))
                .collect(),
            fail: false,
        }
    }

    /// An oracle that is always unreachable.
    pub fn failing() -> Self {
        Self {
            costs: HashMap::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl CostOracle for StaticOracle {
    async fn endpoint_costs(
        &self,
        _src: &PeerId,
        dsts: &[PeerId],
    ) -> Result<HashMap<PeerId, f64>, NetError> {
        if self.fail {
            return Err(NetError::Protocol("oracle offline".to_string()));
        }
        Ok(dsts
            .iter()
            .map(|d| (d.clone(), self.costs.get(d).copied().unwrap_or(f64::INFINITY)))
            .collect())
    }
}

pub async fn build_cluster(
    names: &[&str],
    strategy: StrategyConfig,
    replication: usize,
) -> TestCluster {
    build_cluster_custom(names, strategy, replication, None, false).await
}

pub async fn build_cluster_with_oracle(
    names: &[&str],
    strategy: StrategyConfig,
    replication: usize,
    oracle: Arc<dyn CostOracle>,
) -> TestCluster {
    build_cluster_custom(names, strategy, replication, Some(oracle), false).await
}

pub async fn build_cluster_custom(
    names: &[&str],
    strategy: StrategyConfig,
    replication: usize,
    oracle: Option<Arc<dyn CostOracle>>,
    require_clean: bool,
) -> TestCluster {
    let nodes: Arc<DashMap<PeerId, Arc<PeerNode>>> = Arc::new(DashMap::new());
    let client = Arc::new(LoopbackClient {
        nodes: nodes.clone(),
        down: DashMap::new(),
        floods: AtomicU64::new(0),
        searches: AtomicU64::new(0),
    });

    let ids: Vec<PeerId> = names.iter().map(|n| PeerId::from(*n)).collect();
    let mut dirs = Vec::new();

    for id in &ids {
        let dir = TempDir::new().expect("temp dir");
        let config = PeerConfig {
            self_id: id.clone(),
            known_peers: ids.iter().filter(|p| *p != id).cloned().collect(),
            data_dir: dir.path().to_path_buf(),
            replication_factor: replication,
            chunk_size: 64 * 1024,
            virtual_nodes: 50,
            retry: RetryConfig {
                attempts: 2,
                timeout_ms: 1_000,
            },
            departure: DepartureConfig {
                retry: RetryConfig {
                    attempts: 2,
                    timeout_ms: 1_000,
                },
                require_clean,
            },
            strategy: strategy.clone(),
        };

        let peer_client: Arc<dyn PeerClient> = client.clone();
        let node = PeerNode::new(config, peer_client, oracle.clone())
            .await
            .expect("node construction");
        nodes.insert(id.clone(), node);
        dirs.push(dir);
    }

    TestCluster {
        nodes,
        client,
        _dirs: dirs,
    }
}
