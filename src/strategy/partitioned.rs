//! Partitioned strategy - document partitioning by a semantic attribute
//!
//! Manifests sharing the partition attribute's value co-locate on the same
//! ring-responsible peer set, so equality queries on that attribute reach
//! the right peers in one round trip. Queries without the attribute degrade
//! to a bounded broadcast over the known peers.

use super::{
    local_hits, SearchHit, SearchOutcome, SearchQuery, SearchStrategy, StrategyContext,
    StrategyError,
};
use crate::store::Manifest;
use crate::PeerId;

use async_trait::async_trait;
use std::collections::BTreeMap;

pub struct PartitionedStrategy {
    ctx: StrategyContext,
    attribute: String,
}

impl PartitionedStrategy {
    pub fn new(ctx: StrategyContext, attribute: String) -> Self {
        Self { ctx, attribute }
    }

    fn normalize(value: &str) -> String {
        value.trim().to_lowercase()
    }

    /// The partition value a manifest routes by: the configured attribute
    /// when present, the filename as a fallback.
    fn partition_value(&self, manifest: &Manifest) -> String {
        manifest
            .attributes
            .get(&self.attribute)
            .map(|v| Self::normalize(v))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| Self::normalize(&manifest.filename))
    }

    /// Ask one peer (possibly self) to search its own disk.
    async fn query_peer(&self, peer: &PeerId, query: &SearchQuery) -> Option<Vec<SearchHit>> {
        if *peer == self.ctx.self_id {
            return local_hits(&self.ctx, query).await.ok();
        }

        self.ctx
            .retry
            .run(peer, "search_local", || {
                self.ctx.client.search_local(peer, query)
            })
            .await
            .ok()
    }

    /// Scatter a query over a fixed peer set and merge. Replicas report
    /// the same manifest more than once; collapse by filename, keeping the
    /// newest version.
    async fn scatter(&self, peers: &[PeerId], query: &SearchQuery) -> SearchOutcome {
        let probes = peers.iter().map(|peer| async move {
            (peer.clone(), self.query_peer(peer, query).await)
        });

        let mut merged: BTreeMap<String, SearchHit> = BTreeMap::new();
        let mut partial = false;

        for (peer, result) in futures::future::join_all(probes).await {
            match result {
                Some(peer_hits) => {
                    for hit in peer_hits {
                        match merged.get(&hit.filename) {
                            Some(existing) if existing.updated_at >= hit.updated_at => {}
                            _ => {
                                merged.insert(hit.filename.clone(), hit);
                            }
                        }
                    }
                }
                None => {
                    tracing::warn!("Partition search on {} failed; skipping", peer);
                    partial = true;
                }
            }
        }

        SearchOutcome {
            hits: merged.into_values().collect(),
            partial,
        }
    }
}

#[async_trait]
impl SearchStrategy for PartitionedStrategy {
    fn name(&self) -> &'static str {
        "partitioned"
    }

    fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    async fn write(&self, manifest: &Manifest) -> Result<Vec<PeerId>, StrategyError> {
        let value = self.partition_value(manifest);
        let targets = self
            .ctx
            .directory
            .responsible_for(&value, self.ctx.replication_factor)?;

        tracing::debug!(
            "Partition placement '{}' -> {:?} for '{}'",
            value,
            targets,
            manifest.filename
        );
        Ok(targets)
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchOutcome, StrategyError> {
        if let Some(value) = query.term(&self.attribute) {
            // Equality on the partition attribute: one round trip to the
            // ring-responsible peer set, whatever the network size.
            let targets = self
                .ctx
                .directory
                .responsible_for(&Self::normalize(value), self.ctx.replication_factor)?;
            return Ok(self.scatter(&targets, query).await);
        }

        // No partition key: degrade to broadcasting over the known peers.
        tracing::debug!(
            "Query lacks partition attribute '{}'; broadcasting",
            self.attribute
        );
        let peers = self.ctx.directory.all_peers();
        Ok(self.scatter(&peers, query).await)
    }

    fn placement_key(&self, manifest: &Manifest) -> String {
        self.partition_value(manifest)
    }
}
