//! PeerClient / CostOracle traits and the bounded-retry wrapper

use super::{FloodRequest, GossipMessage, NetError};
use crate::store::{ContentHash, IndexEntry, Manifest};
use crate::strategy::{SearchHit, SearchOutcome, SearchQuery};
use crate::{PeerId, RetryConfig};

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Outbound request surface toward one remote peer, implemented by the
/// external transport layer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn store_chunk(
        &self,
        peer: &PeerId,
        hash: &ContentHash,
        data: &[u8],
    ) -> Result<(), NetError>;

    async fn get_chunk(&self, peer: &PeerId, hash: &ContentHash) -> Result<Vec<u8>, NetError>;

    async fn store_manifest(&self, peer: &PeerId, manifest: &Manifest) -> Result<(), NetError>;

    async fn get_manifest(&self, peer: &PeerId, filename: &str) -> Result<Manifest, NetError>;

    async fn update_manifest(
        &self,
        peer: &PeerId,
        filename: &str,
        new_owner: &PeerId,
    ) -> Result<(), NetError>;

    /// Ask a peer to search only its own disk
    async fn search_local(
        &self,
        peer: &PeerId,
        query: &SearchQuery,
    ) -> Result<Vec<SearchHit>, NetError>;

    /// Hand a flood probe to a neighbor; the reply aggregates the
    /// neighbor's own hits and whatever its forwarding collected
    async fn flood(&self, peer: &PeerId, request: &FloodRequest)
        -> Result<SearchOutcome, NetError>;

    async fn index_put(&self, peer: &PeerId, key: &str, entry: &IndexEntry)
        -> Result<(), NetError>;

    async fn index_get(&self, peer: &PeerId, key: &str) -> Result<Vec<IndexEntry>, NetError>;

    /// Liveness probe, returning the measured round-trip time
    async fn ping(&self, peer: &PeerId) -> Result<Duration, NetError>;

    async fn gossip(&self, peer: &PeerId, message: &GossipMessage) -> Result<(), NetError>;
}

/// External oracle mapping peer pairs to a physical network cost
/// (round-trip time plus an inter-provider penalty).
#[async_trait]
pub trait CostOracle: Send + Sync {
    async fn endpoint_costs(
        &self,
        src: &PeerId,
        dsts: &[PeerId],
    ) -> Result<HashMap<PeerId, f64>, NetError>;
}

/// Bounded retry with a per-attempt timeout.
///
/// Transient failures (`Unreachable`, `Timeout`) are retried up to the
/// ceiling; application-level rejections (`Remote`, e.g. not-found) are
/// final and returned immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            timeout: config.timeout(),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(
        &self,
        peer: &PeerId,
        what: &str,
        mut call: F,
    ) -> Result<T, NetError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NetError>>,
    {
        let mut last = NetError::Unreachable {
            peer: peer.clone(),
            reason: "no attempt made".to_string(),
        };

        for attempt in 1..=self.attempts {
            match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e @ NetError::Remote { .. })) => return Err(e),
                Ok(Err(e)) => {
                    tracing::warn!(
                        "{} to {} failed (attempt {}/{}): {}",
                        what,
                        peer,
                        attempt,
                        self.attempts,
                        e
                    );
                    last = e;
                }
                Err(_) => {
                    tracing::warn!(
                        "{} to {} timed out after {:?} (attempt {}/{})",
                        what,
                        peer,
                        self.timeout,
                        attempt,
                        self.attempts
                    );
                    last = NetError::Timeout { peer: peer.clone() };
                }
            }
        }

        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy {
            attempts,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let peer = PeerId::from("peer1:5000");
        let calls = AtomicU32::new(0);

        let result = policy(3, 100)
            .run(&peer, "store_chunk", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(NetError::Unreachable {
                        peer: PeerId::from("peer1:5000"),
                        reason: "connection refused".to_string(),
                    })
                } else {
                    Ok(42u32)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_retry_ceiling() {
        let peer = PeerId::from("peer1:5000");
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy(2, 100)
            .run(&peer, "ping", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NetError::Unreachable {
                    peer: PeerId::from("peer1:5000"),
                    reason: "down".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(NetError::Unreachable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remote_rejection_is_final() {
        let peer = PeerId::from("peer1:5000");
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy(3, 100)
            .run(&peer, "get_manifest", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(NetError::Remote {
                    peer: PeerId::from("peer1:5000"),
                    reason: "manifest not found".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(NetError::Remote { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_attempt() {
        let peer = PeerId::from("peer1:5000");
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy(2, 20)
            .run(&peer, "get_chunk", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(NetError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
