//! Search Strategies - four interchangeable placement/routing policies
//!
//! All four variants share one contract: `write` picks the peers a
//! manifest is shipped to (performing any secondary-index writes on the
//! way), `query` routes a search and aggregates the matching manifests.
//! The variant is selected once at peer start-up from configuration.

mod flooding;
mod indexed;
mod network_aware;
mod partitioned;

pub use flooding::FloodingStrategy;
pub use indexed::IndexedStrategy;
pub use network_aware::NetworkAwareStrategy;
pub use partitioned::PartitionedStrategy;

use crate::membership::PeerDirectory;
use crate::net::{CostOracle, FloodRequest, NetError, PeerClient, RetryPolicy};
use crate::store::{LocalStore, Manifest, StoreError};
use crate::{PeerId, StrategyConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Ring error: {0}")]
    Ring(#[from] crate::ring::RingError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),
}

/// Equality search over manifest attributes (logical AND of all terms,
/// case-insensitive). The reserved term `filename` matches the manifest
/// filename itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub terms: BTreeMap<String, String>,
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_term(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.insert(key.into(), value.into());
        self
    }

    pub fn term(&self, key: &str) -> Option<&str> {
        self.terms.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, manifest: &Manifest) -> bool {
        self.terms.iter().all(|(key, value)| {
            let actual = if key == "filename" {
                Some(manifest.filename.as_str())
            } else {
                manifest.attributes.get(key).map(String::as_str)
            };
            actual.is_some_and(|a| a.eq_ignore_ascii_case(value))
        })
    }
}

/// One matching manifest reported by a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub filename: String,
    pub attributes: BTreeMap<String, String>,

    /// Peer that reported the hit
    pub host: PeerId,

    /// The hit's last-writer-wins timestamp
    pub updated_at: i64,

    /// Full manifest when the reporting peer holds it (enables read repair)
    pub manifest: Option<Manifest>,
}

/// Aggregated query result. `partial` is set when at least one peer or
/// index bucket could not be reached; results are still returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub hits: Vec<SearchHit>,
    pub partial: bool,
}

/// Everything a strategy needs to route: the membership view, the local
/// store, and the transport client. Cloned into each strategy at start-up.
#[derive(Clone)]
pub struct StrategyContext {
    pub self_id: PeerId,
    pub directory: Arc<PeerDirectory>,
    pub store: Arc<LocalStore>,
    pub client: Arc<dyn PeerClient>,
    pub retry: RetryPolicy,
    pub replication_factor: usize,
}

/// The shared strategy contract.
#[async_trait]
pub trait SearchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn context(&self) -> &StrategyContext;

    /// Peers that should hold a copy of this manifest. Secondary-index
    /// writes (Indexed-Salted) happen inside this call.
    async fn write(&self, manifest: &Manifest) -> Result<Vec<PeerId>, StrategyError>;

    /// Route a query and aggregate the matching manifests.
    async fn query(&self, query: &SearchQuery) -> Result<SearchOutcome, StrategyError>;

    /// Inbound flood probe. Only the Flooding strategy forwards; everyone
    /// else answers from local storage.
    async fn handle_flood(&self, request: &FloodRequest) -> Result<SearchOutcome, StrategyError> {
        let hits = local_hits(self.context(), &request.query).await?;
        Ok(SearchOutcome {
            hits,
            partial: false,
        })
    }

    /// Order candidate source peers for a chunk/manifest transfer.
    /// Logical (ring) order by default; NetworkAware reorders by cost.
    async fn rank_sources(&self, _key: &str, candidates: Vec<PeerId>) -> Vec<PeerId> {
        candidates
    }

    /// The ring key this manifest is placed by. The departure protocol
    /// recomputes ownership with the same key.
    fn placement_key(&self, manifest: &Manifest) -> String {
        manifest.filename.clone()
    }
}

/// Match a query against the local manifests.
pub(crate) async fn local_hits(
    ctx: &StrategyContext,
    query: &SearchQuery,
) -> Result<Vec<SearchHit>, StrategyError> {
    let manifests = ctx.store.list_manifests().await?;

    Ok(manifests
        .into_iter()
        .filter(|m| query.matches(m))
        .map(|m| SearchHit {
            filename: m.filename.clone(),
            attributes: m.attributes.clone(),
            host: ctx.self_id.clone(),
            updated_at: m.updated_at,
            manifest: Some(m),
        })
        .collect())
}

/// Instantiate the configured strategy. Exactly one variant is selected
/// at peer start-up.
pub fn make_strategy(
    config: &StrategyConfig,
    ctx: StrategyContext,
    oracle: Option<Arc<dyn CostOracle>>,
) -> Arc<dyn SearchStrategy> {
    match config {
        StrategyConfig::Flooding { ttl, fanout } => {
            Arc::new(FloodingStrategy::new(ctx, *ttl, *fanout))
        }
        StrategyConfig::Indexed {
            salt_buckets,
            popularity_threshold,
        } => Arc::new(IndexedStrategy::new(ctx, *salt_buckets, *popularity_threshold)),
        StrategyConfig::Partitioned { attribute } => {
            Arc::new(PartitionedStrategy::new(ctx, attribute.clone()))
        }
        StrategyConfig::NetworkAware {
            top_k,
            alpha,
            cost_ttl_secs,
        } => Arc::new(NetworkAwareStrategy::new(
            ctx,
            oracle,
            *top_k,
            *alpha,
            std::time::Duration::from_secs(*cost_ttl_secs),
        )),
    }
}
