//! NetworkAware strategy - ring ranking re-scored by physical cost
//!
//! A cost oracle supplies peer-pair costs (round-trip time plus an
//! inter-provider penalty). The top-K logically-ranked ring candidates are
//! reordered by a composite of logical rank and physical cost; when the
//! oracle is unreachable the strategy degrades to pure ring order instead
//! of failing.

use super::{
    local_hits, SearchHit, SearchOutcome, SearchQuery, SearchStrategy, StrategyContext,
    StrategyError,
};
use crate::net::CostOracle;
use crate::store::Manifest;
use crate::PeerId;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct CostCache {
    costs: HashMap<PeerId, f64>,
    fetched_at: Option<Instant>,
}

pub struct NetworkAwareStrategy {
    ctx: StrategyContext,
    oracle: Option<Arc<dyn CostOracle>>,
    top_k: usize,
    alpha: f64,
    cost_ttl: Duration,
    cache: Mutex<CostCache>,
}

impl NetworkAwareStrategy {
    pub fn new(
        ctx: StrategyContext,
        oracle: Option<Arc<dyn CostOracle>>,
        top_k: usize,
        alpha: f64,
        cost_ttl: Duration,
    ) -> Self {
        Self {
            ctx,
            oracle,
            top_k: top_k.max(2),
            alpha: alpha.clamp(0.0, 1.0),
            cost_ttl,
            cache: Mutex::new(CostCache::default()),
        }
    }

    /// Current costs from self to the given peers. Refreshes the cache
    /// past its TTL; a failed refresh keeps serving the stale map, and
    /// with no map at all the caller falls back to logical order.
    async fn costs_for(&self, peers: &[PeerId]) -> Option<HashMap<PeerId, f64>> {
        let oracle = self.oracle.as_ref()?;

        let (fresh, known) = {
            let cache = self.cache.lock();
            let fresh = cache
                .fetched_at
                .is_some_and(|at| at.elapsed() < self.cost_ttl);
            let known = peers.iter().all(|p| cache.costs.contains_key(p));
            (fresh, known)
        };

        if !(fresh && known) {
            match oracle.endpoint_costs(&self.ctx.self_id, peers).await {
                Ok(costs) => {
                    let mut cache = self.cache.lock();
                    cache.costs.extend(costs);
                    cache.fetched_at = Some(Instant::now());
                }
                Err(e) => {
                    tracing::debug!("Cost oracle refresh failed: {}", e);
                }
            }
        }

        let cache = self.cache.lock();
        if cache.fetched_at.is_none() {
            return None;
        }
        Some(cache.costs.clone())
    }

    /// Reorder the top-K candidates by `alpha * cost + (1 - alpha) * rank`
    /// (both min-max normalized); candidates past K keep their logical
    /// ring order, as does everything when no cost data is available.
    async fn rank(&self, candidates: Vec<PeerId>) -> Vec<PeerId> {
        if candidates.len() <= 1 {
            return candidates;
        }

        let Some(costs) = self.costs_for(&candidates).await else {
            tracing::debug!("No cost data; keeping logical ring order");
            return candidates;
        };

        let cut = self.top_k.min(candidates.len());

        let finite: Vec<f64> = candidates[..cut]
            .iter()
            .filter_map(|p| costs.get(p))
            .copied()
            .filter(|c| c.is_finite())
            .collect();
        let (cost_min, cost_max) = match (
            finite.iter().copied().reduce(f64::min),
            finite.iter().copied().reduce(f64::max),
        ) {
            (Some(min), Some(max)) => (min, max),
            _ => {
                tracing::debug!("No finite costs among candidates; keeping ring order");
                return candidates;
            }
        };

        let mut scored: Vec<(f64, PeerId)> = candidates[..cut]
            .iter()
            .enumerate()
            .map(|(rank, peer)| {
                let cost_norm = match costs.get(peer).copied().filter(|c| c.is_finite()) {
                    Some(cost) if cost_max > cost_min => (cost - cost_min) / (cost_max - cost_min),
                    Some(_) => 0.0,
                    None => 1.0,
                };
                let rank_norm = rank as f64 / (cut - 1).max(1) as f64;
                let score = self.alpha * cost_norm + (1.0 - self.alpha) * rank_norm;
                (score, peer.clone())
            })
            .collect();

        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut reordered: Vec<PeerId> = scored.into_iter().map(|(_, peer)| peer).collect();
        reordered.extend_from_slice(&candidates[cut..]);
        reordered
    }

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
}

#[async_trait]
impl SearchStrategy for NetworkAwareStrategy {
    fn name(&self) -> &'static str {
        "network-aware"
    }

    fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    /// Ring placement for the filename, transfer order chosen by cost.
    async fn write(&self, manifest: &Manifest) -> Result<Vec<PeerId>, StrategyError> {
        let candidates = self
            .ctx
            .directory
            .responsible_for(&manifest.filename, self.ctx.replication_factor)?;
        Ok(self.rank(candidates).await)
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchOutcome, StrategyError> {
        if let Some(filename) = query.term("filename") {
            // Route by the ring candidates for that key, cheapest first;
            // the first peer that answers with hits wins.
            let candidates = self
                .ctx
                .directory
                .responsible_for(filename, self.ctx.replication_factor)?;
            let ranked = self.rank(candidates).await;

            let mut partial = false;
            for peer in &ranked {
                match self.query_peer(peer, query).await {
                    Some(hits) if !hits.is_empty() => {
                        return Ok(SearchOutcome { hits, partial });
                    }
                    Some(_) => {}
                    None => partial = true,
                }
            }
            return Ok(SearchOutcome {
                hits: Vec::new(),
                partial,
            });
        }

        // Attribute queries have no single ring key: ask every known peer,
        // cheapest ordering first so early answers come from nearby.
        let peers = self.rank(self.ctx.directory.all_peers()).await;
        let probes = peers.iter().map(|peer| async move {
            (peer.clone(), self.query_peer(peer, query).await)
        });

        let mut hits = Vec::new();
        let mut partial = false;
        for (peer, result) in futures::future::join_all(probes).await {
            match result {
                Some(peer_hits) => hits.extend(peer_hits),
                None => {
                    tracing::warn!("Search on {} failed; skipping", peer);
                    partial = true;
                }
            }
        }

        Ok(SearchOutcome { hits, partial })
    }

    async fn rank_sources(&self, _key: &str, candidates: Vec<PeerId>) -> Vec<PeerId> {
        self.rank(candidates).await
    }
}
