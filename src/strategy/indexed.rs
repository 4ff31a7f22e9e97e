//! Indexed-Salted strategy - global secondary index with hot-key salting
//!
//! Every attribute write lands in a salted index bucket placed on the ring
//! like any other key. Keys whose write popularity exceeds the threshold
//! spread across all salt buckets, bounding the per-peer load of a hot key
//! to roughly 1/S of the naive equivalent; reads always fan out to all S
//! buckets and merge.

use super::{
    SearchHit, SearchOutcome, SearchQuery, SearchStrategy, StrategyContext, StrategyError,
};
use crate::ring::ring_position;
use crate::store::{IndexEntry, Manifest};
use crate::PeerId;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

pub struct IndexedStrategy {
    ctx: StrategyContext,
    salt_buckets: u32,
    popularity_threshold: u64,

    /// Write-popularity estimate per base key
    write_counts: DashMap<String, u64>,
}

impl IndexedStrategy {
    pub fn new(ctx: StrategyContext, salt_buckets: u32, popularity_threshold: u64) -> Self {
        Self {
            ctx,
            salt_buckets: salt_buckets.max(1),
            popularity_threshold,
            write_counts: DashMap::new(),
        }
    }

    fn base_key(attribute: &str, value: &str) -> String {
        format!(
            "{}:{}",
            attribute.to_lowercase(),
            value.trim().to_lowercase()
        )
    }

    fn bucket_key(base: &str, bucket: u32) -> String {
        format!("{}:{}", base, bucket)
    }

    /// Pick the bucket one write goes to. Cold keys stay in bucket 0; hot
    /// keys spread by a deterministic sub-hash of the manifest filename,
    /// so each bucket carries ~1/S of that key's writes.
    fn bucket_for(&self, base: &str, filename: &str) -> u32 {
        let count = {
            let mut entry = self.write_counts.entry(base.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if count > self.popularity_threshold {
            (ring_position(filename) % self.salt_buckets as u64) as u32
        } else {
            0
        }
    }

    async fn write_index_entry(&self, key: &str, entry: IndexEntry) {
        let owner = match self.ctx.directory.primary_for(key) {
            Ok(owner) => owner,
            Err(e) => {
                tracing::warn!("Index write for '{}' skipped: {}", key, e);
                return;
            }
        };

        let result = if owner == self.ctx.self_id {
            self.ctx
                .store
                .put_index_entry(key, entry)
                .await
                .map_err(|e| e.to_string())
        } else {
            self.ctx
                .retry
                .run(&owner, "index_put", || {
                    self.ctx.client.index_put(&owner, key, &entry)
                })
                .await
                .map_err(|e| e.to_string())
        };

        // Index writes are best-effort bookkeeping; a lost entry only
        // hides the file from attribute search, never from fetch.
        if let Err(reason) = result {
            tracing::warn!("Index write for '{}' on {} failed: {}", key, owner, reason);
        }
    }

    /// Fetch one bucket, from disk when this peer owns it.
    async fn read_bucket(&self, key: &str) -> Option<Vec<IndexEntry>> {
        let owner = self.ctx.directory.primary_for(key).ok()?;

        if owner == self.ctx.self_id {
            self.ctx.store.get_index_entries(key).await.ok()
        } else {
            self.ctx
                .retry
                .run(&owner, "index_get", || self.ctx.client.index_get(&owner, key))
                .await
                .ok()
        }
    }

    /// All S buckets of one attribute term, merged and deduplicated by
    /// manifest id. `None` entries in the scatter mark unreachable buckets.
    async fn gather_attribute(&self, base: &str) -> (HashMap<String, SearchHit>, bool) {
        let keys: Vec<String> = (0..self.salt_buckets)
            .map(|bucket| Self::bucket_key(base, bucket))
            .collect();

        let fetches = keys.iter().map(|key| self.read_bucket(key));
        let buckets = futures::future::join_all(fetches).await;

        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        let mut partial = false;

        for bucket in buckets {
            match bucket {
                Some(entries) => {
                    for entry in entries {
                        merged
                            .entry(entry.filename.clone())
                            .or_insert_with(|| SearchHit {
                                filename: entry.filename,
                                attributes: entry.attributes,
                                host: entry.host,
                                updated_at: 0,
                                manifest: None,
                            });
                    }
                }
                None => partial = true,
            }
        }

        (merged, partial)
    }
}

#[async_trait]
impl SearchStrategy for IndexedStrategy {
    fn name(&self) -> &'static str {
        "indexed-salted"
    }

    fn context(&self) -> &StrategyContext {
        &self.ctx
    }

    /// Manifests place like the naive scheme (ring on filename); the
    /// attribute index entries fan out to their salted buckets here.
    async fn write(&self, manifest: &Manifest) -> Result<Vec<PeerId>, StrategyError> {
        let targets = self
            .ctx
            .directory
            .responsible_for(&manifest.filename, self.ctx.replication_factor)?;

        for (attribute, value) in &manifest.attributes {
            let base = Self::base_key(attribute, value);
            let bucket = self.bucket_for(&base, &manifest.filename);
            let key = Self::bucket_key(&base, bucket);

            let entry = IndexEntry {
                filename: manifest.filename.clone(),
                attributes: manifest.attributes.clone(),
                host: self.ctx.self_id.clone(),
            };

            self.write_index_entry(&key, entry).await;
        }

        Ok(targets)
    }

    /// Scatter-gather over every bucket of every query term, then
    /// intersect across terms (logical AND).
    async fn query(&self, query: &SearchQuery) -> Result<SearchOutcome, StrategyError> {
        if query.is_empty() {
            return Ok(SearchOutcome::default());
        }

        let mut partial = false;
        let mut intersection: Option<HashMap<String, SearchHit>> = None;

        for (attribute, value) in &query.terms {
            let base = Self::base_key(attribute, value);
            let (matches, attr_partial) = self.gather_attribute(&base).await;
            partial |= attr_partial;

            intersection = Some(match intersection {
                None => matches,
                Some(mut current) => {
                    current.retain(|filename, _| matches.contains_key(filename));
                    current
                }
            });
        }

        let hits = intersection.unwrap_or_default().into_values().collect();
        Ok(SearchOutcome { hits, partial })
    }
}
