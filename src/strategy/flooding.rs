//! Flooding strategy - unstructured broadcast search
//!
//! Queries fan out to neighbors with a decrementing TTL. Receivers
//! deduplicate by query id, answer from local storage, and forward only on
//! first receipt while TTL remains. Robust to churn, no load control:
//! message cost is bounded by fanout^TTL.

use super::{
    local_hits, SearchHit, SearchOutcome, SearchQuery, SearchStrategy, StrategyContext,
    StrategyError,
};
use crate::net::FloodRequest;
use crate::store::Manifest;
use crate::PeerId;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How long a query id is remembered for deduplication
const SEEN_TTL: Duration = Duration::from_secs(60);

/// Seen-set size that triggers a prune pass
const SEEN_PRUNE_LEN: usize = 4096;

pub struct FloodingStrategy {
    ctx: StrategyContext,
    ttl: u32,
    fanout: usize,
    seen: DashMap<Uuid, Instant>,
}

impl FloodingStrategy {
    pub fn new(ctx: StrategyContext, ttl: u32, fanout: usize) -> Self {
        Self {
            ctx,
            ttl,
            fanout,
            seen: DashMap::new(),
        }
    }

    /// Up to `fanout` random neighbors (all of them when fanout is 0).
    fn sample_neighbors(&self) -> Vec<PeerId> {
        let neighbors = self.ctx.directory.neighbors();

        if self.fanout == 0 || neighbors.len() <= self.fanout {
            return neighbors;
        }

        let mut rng = rand::thread_rng();
        neighbors
            .choose_multiple(&mut rng, self.fanout)
            .cloned()
            .collect()
    }

    /// Deliver a probe to each peer. A failed probe is not retried: the
    /// receiver's dedup would swallow the second delivery anyway.
    async fn fan_out(&self, peers: &[PeerId], request: &FloodRequest) -> (Vec<SearchHit>, bool) {
        let probes = peers.iter().map(|peer| async move {
            let outcome = tokio::time::timeout(
                self.ctx.retry.timeout,
                self.ctx.client.flood(peer, request),
            )
            .await;
            (peer, outcome)
        });

        let mut hits = Vec::new();
        let mut partial = false;

        for (peer, outcome) in futures::future::join_all(probes).await {
            match outcome {
                Ok(Ok(remote)) => {
                    hits.extend(remote.hits);
                    partial |= remote.partial;
                }
                Ok(Err(e)) => {
                    tracing::warn!("Flood probe to {} failed: {}", peer, e);
                    partial = true;
                }
                Err(_) => {
                    tracing::warn!("Flood probe to {} timed out", peer);
                    partial = true;
                }
            }
        }

        (hits, partial)
    }

    fn prune_seen(&self) {
        if self.seen.len() > SEEN_PRUNE_LEN {
            let cutoff = Instant::now() - SEEN_TTL;
            self.seen.retain(|_, first_seen| *first_seen > cutoff);
        }
    }

    /// Last-writer-wins reconciliation across the versions each peer
    /// reported. Stale holders get the winning manifest pushed back
    /// (read repair) off the query path.
    fn resolve_conflicts(&self, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let mut grouped: BTreeMap<String, Vec<SearchHit>> = BTreeMap::new();
        for hit in hits {
            grouped.entry(hit.filename.clone()).or_default().push(hit);
        }

        let mut winners = Vec::new();
        for (_, versions) in grouped {
            let Some(winner) = versions.iter().max_by_key(|h| h.updated_at).cloned() else {
                continue;
            };

            if let Some(manifest) = &winner.manifest {
                for stale in versions
                    .iter()
                    .filter(|v| v.updated_at < winner.updated_at && v.host != winner.host)
                {
                    self.spawn_read_repair(&stale.host, manifest);
                }
            }

            winners.push(winner);
        }
        winners
    }

    fn spawn_read_repair(&self, host: &PeerId, manifest: &Manifest) {
        tracing::info!(
            "Read repair: pushing newer '{}' to {}",
            manifest.filename,
            host
        );
        let client = self.ctx.client.clone();
        let host = host.clone();
        let manifest = manifest.clone();
        tokio::spawn(async move {
            if let Err(e) = client.store_manifest(&host, &manifest).await {
                tracing::debug!("Read repair to {} failed: {}", host, e);
            }
        });
    }
}

#[async_trait]
impl SearchStrategy for FloodingStrategy {
    fn name(&self) -> &'static str {
        "flooding"
    }

    fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    async fn write(&self, manifest: &Manifest) -> Result<Vec<PeerId>, StrategyError> {
        Ok(self
            .ctx
            .directory
            .responsible_for(&manifest.filename, self.ctx.replication_factor)?)
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchOutcome, StrategyError> {
        let mut hits = local_hits(&self.ctx, query).await?;
        let mut partial = false;

        if self.ttl > 0 {
            let request = FloodRequest::new(self.ctx.self_id.clone(), query.clone(), self.ttl);
            // Never re-process our own query if it loops back.
            self.seen.insert(request.query_id, Instant::now());

            let targets = self.sample_neighbors();
            let (remote, remote_partial) = self.fan_out(&targets, &request).await;
            hits.extend(remote);
            partial = remote_partial;
        }

        Ok(SearchOutcome {
            hits: self.resolve_conflicts(hits),
            partial,
        })
    }

    async fn handle_flood(&self, request: &FloodRequest) -> Result<SearchOutcome, StrategyError> {
        if self
            .seen
            .insert(request.query_id, Instant::now())
            .is_some()
        {
            // Already processed this query; contribute nothing new.
            return Ok(SearchOutcome::default());
        }
        self.prune_seen();

        let mut hits = local_hits(&self.ctx, &request.query).await?;
        let mut partial = false;

        // Dedup, not topology, is what breaks re-broadcast loops: the
        // probe may flow back toward peers that have already seen it.
        let next_hop = request.forwarded();
        if next_hop.ttl > 0 {
            let targets = self.sample_neighbors();
            let (remote, remote_partial) = self.fan_out(&targets, &next_hop).await;
            hits.extend(remote);
            partial = remote_partial;
        }

        Ok(SearchOutcome { hits, partial })
    }
}
