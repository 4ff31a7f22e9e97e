//! Graceful-departure protocol

use super::{MembershipError, PeerDirectory};
use crate::net::{GossipMessage, NetError, PeerClient, RetryPolicy};
use crate::store::{LocalStore, Manifest};
use crate::strategy::SearchStrategy;
use crate::PeerId;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lifecycle of a peer's ring membership. `Left` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Active,
    Draining,
    Left,
}

/// One manifest that could not be handed over
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationFailure {
    pub filename: String,
    pub target: Option<PeerId>,
    pub reason: String,
}

/// Result of one departure run. `migrated + failed == total` always holds:
/// every manifest held at the start of the run ends in exactly one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartureSummary {
    pub migrated: usize,
    pub failed: usize,
    pub total: usize,
    pub failures: Vec<MigrationFailure>,
}

/// Tracks membership state and executes the graceful departure.
///
/// The protocol is idempotent: migrated manifests are deleted locally, so
/// re-invoking after a partial failure only retries the ones still here.
pub struct MembershipManager {
    directory: Arc<PeerDirectory>,
    store: Arc<LocalStore>,
    client: Arc<dyn PeerClient>,
    strategy: Arc<dyn SearchStrategy>,
    replication_factor: usize,
    retry: RetryPolicy,
    require_clean: bool,
    state: RwLock<PeerState>,
}

impl MembershipManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<PeerDirectory>,
        store: Arc<LocalStore>,
        client: Arc<dyn PeerClient>,
        strategy: Arc<dyn SearchStrategy>,
        replication_factor: usize,
        retry: RetryPolicy,
        require_clean: bool,
    ) -> Self {
        Self {
            directory,
            store,
            client,
            strategy,
            replication_factor,
            retry,
            require_clean,
            state: RwLock::new(PeerState::Active),
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    /// Apply a membership announcement received from the network.
    pub fn handle_gossip(&self, message: &GossipMessage) {
        match message {
            GossipMessage::Join { peer } => {
                self.directory.add_peer(peer);
            }
            GossipMessage::Leave { peer } => {
                self.directory.remove_peer(peer);
            }
            GossipMessage::PeerList { peers } => {
                let added = self.directory.merge_peers(peers);
                if !added.is_empty() {
                    tracing::debug!("Gossip introduced {} new peer(s)", added.len());
                }
            }
        }
    }

    /// Execute the graceful departure: migrate every locally held manifest
    /// (and its locally held chunks) to the peer that owns it once self is
    /// off the ring, then remove self's tokens and announce the leave.
    ///
    /// Failures are recorded per manifest and reported in the summary; the
    /// protocol still completes unless `require_clean` is set, in which
    /// case a run with failures stays in `Draining` so it can be retried.
    pub async fn depart(&self) -> Result<DepartureSummary, MembershipError> {
        *self.state.write() = PeerState::Draining;
        let self_id = self.directory.self_id().clone();

        let manifests = self.store.list_manifests().await?;
        let total = manifests.len();

        if total > 0 && self.directory.neighbors().is_empty() {
            return Err(MembershipError::Isolated(total));
        }

        tracing::info!("Draining {}: {} manifest(s) to hand over", self_id, total);

        let mut migrated = 0;
        let mut failures = Vec::new();

        for manifest in manifests {
            let placement_key = self.strategy.placement_key(&manifest);

            let targets = match self.directory.responsible_for_excluding(
                &placement_key,
                self.replication_factor,
                &self_id,
            ) {
                Ok(targets) => targets,
                Err(e) => {
                    failures.push(MigrationFailure {
                        filename: manifest.filename.clone(),
                        target: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let new_primary = targets[0].clone();
            match self.migrate_manifest(&manifest, &self_id, &new_primary).await {
                Ok(()) => {
                    self.store.delete_manifest(&manifest.filename).await?;
                    migrated += 1;
                    tracing::info!(
                        "Migrated manifest '{}' to {}",
                        manifest.filename,
                        new_primary
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to migrate manifest '{}' to {}: {}",
                        manifest.filename,
                        new_primary,
                        e
                    );
                    failures.push(MigrationFailure {
                        filename: manifest.filename.clone(),
                        target: Some(new_primary),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let failed = failures.len();
        let summary = DepartureSummary {
            migrated,
            failed,
            total,
            failures,
        };

        if failed > 0 && self.require_clean {
            tracing::warn!(
                "Departure incomplete ({}/{} migrated); staying in Draining for retry",
                migrated,
                total
            );
            return Ok(summary);
        }

        self.directory.remove_peer(&self_id);
        let leave = GossipMessage::Leave {
            peer: self_id.clone(),
        };
        for peer in self.directory.neighbors() {
            if let Err(e) = self.client.gossip(&peer, &leave).await {
                tracing::debug!("Leave announcement to {} failed: {}", peer, e);
            }
        }

        *self.state.write() = PeerState::Left;
        tracing::info!(
            "Departure of {} complete: {} migrated, {} failed, {} total",
            self_id,
            summary.migrated,
            summary.failed,
            summary.total
        );

        Ok(summary)
    }

    /// Hand one manifest (and its locally held chunks) to the new primary.
    /// Bounded retries with a per-attempt timeout; the whole transfer is
    /// re-run on retry, which is safe because chunk stores are idempotent.
    async fn migrate_manifest(
        &self,
        manifest: &Manifest,
        self_id: &PeerId,
        target: &PeerId,
    ) -> Result<(), NetError> {
        self.retry
            .run(target, "migrate", || async {
                for hash in manifest.chunks() {
                    if self.store.has_chunk(&hash).await {
                        let data = self
                            .store
                            .get_chunk(&hash)
                            .await
                            .map_err(|e| NetError::Protocol(e.to_string()))?;
                        self.client.store_chunk(target, &hash, &data).await?;
                    }
                }

                // The chunks travel with the manifest, so the owner set
                // swaps the departing peer for the new primary.
                let mut outgoing = manifest.clone();
                outgoing.owners.remove(self_id);
                outgoing.owners.insert(target.clone());

                self.client.store_manifest(target, &outgoing).await
            })
            .await
    }
}
