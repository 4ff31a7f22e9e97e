//! SwarmBench Core - P2P File-Sharing Testbed Engine
//!
//! This crate provides the per-node placement-and-routing core for a
//! peer-to-peer file-sharing testbed: a consistent-hashing ring assigns
//! chunks and manifests to peers, four interchangeable search strategies
//! route writes and queries on top of it, and a graceful-departure
//! protocol redistributes a leaving peer's manifests.

pub mod membership;
pub mod net;
pub mod node;
pub mod ring;
pub mod store;
pub mod strategy;

#[cfg(test)]
pub(crate) mod test_util;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for SwarmBench operations
#[derive(Error, Debug)]
pub enum SwarmBenchError {
    #[error("Ring error: {0}")]
    Ring(#[from] ring::RingError),

    #[error("Storage error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Network error: {0}")]
    Net(#[from] net::NetError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] strategy::StrategyError),

    #[error("Membership error: {0}")]
    Membership(#[from] membership::MembershipError),

    #[error("File '{filename}' incomplete: {} chunk(s) unavailable", .missing.len())]
    IncompleteFile {
        filename: String,
        missing: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SwarmBenchError>;

/// Identity of a peer in the network (its reachable address, e.g. "peer1:5000")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Bounded retry for remote calls
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call before the peer is skipped
    pub attempts: u32,

    /// Per-attempt timeout (milliseconds)
    pub timeout_ms: u64,
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 5_000,
        }
    }
}

/// Graceful-departure tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartureConfig {
    /// Per-manifest migration retry budget
    pub retry: RetryConfig,

    /// When set, the peer stays in `Draining` (still on the ring) while
    /// any manifest failed to migrate, so a re-invocation can finish the
    /// drain. Off by default: departure completes despite failures.
    pub require_clean: bool,
}

impl Default for DepartureConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                attempts: 3,
                timeout_ms: 3_000,
            },
            require_clean: false,
        }
    }
}

/// Operating mode selecting one search strategy, with its parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Broadcast queries to neighbors with a decrementing TTL
    Flooding { ttl: u32, fanout: usize },

    /// Global secondary index with hot-key salting
    Indexed {
        salt_buckets: u32,
        popularity_threshold: u64,
    },

    /// Document partitioning by one semantic attribute
    Partitioned { attribute: String },

    /// Ring ranking re-scored by physical network cost
    NetworkAware {
        top_k: usize,
        alpha: f64,
        cost_ttl_secs: u64,
    },
}

/// Immutable per-peer configuration, constructed once at start-up and
/// passed down to the ring, store, and strategy instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// This peer's own address
    pub self_id: PeerId,

    /// Addresses known at start-up (the ring is seeded with these + self)
    pub known_peers: Vec<PeerId>,

    /// Local storage path
    pub data_dir: PathBuf,

    /// Distinct peers required to hold a copy of each key
    pub replication_factor: usize,

    /// Fixed chunk size for file splitting (bytes)
    pub chunk_size: usize,

    /// Virtual-node tokens per physical peer
    pub virtual_nodes: usize,

    /// Retry budget for ordinary remote calls
    pub retry: RetryConfig,

    /// Graceful-departure tuning
    pub departure: DepartureConfig,

    /// Active search strategy and its parameters
    pub strategy: StrategyConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            self_id: PeerId::new("127.0.0.1:5000"),
            known_peers: vec![],
            data_dir: PathBuf::from("./swarmbench_data"),
            replication_factor: 3,
            chunk_size: 1024 * 1024, // 1 MiB
            virtual_nodes: 100,
            retry: RetryConfig::default(),
            departure: DepartureConfig::default(),
            strategy: StrategyConfig::Flooding { ttl: 2, fanout: 8 },
        }
    }
}

static TRACING_INIT: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PeerConfig::default();

        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert!(config.virtual_nodes >= 100);
        assert!(matches!(config.strategy, StrategyConfig::Flooding { .. }));
    }

    #[test]
    fn test_strategy_config_roundtrip() {
        let strategy = StrategyConfig::Indexed {
            salt_buckets: 4,
            popularity_threshold: 32,
        };

        let json = serde_json::to_string(&strategy).unwrap();
        assert!(json.contains("\"mode\":\"indexed\""));

        let back: StrategyConfig = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, StrategyConfig::Indexed { salt_buckets: 4, .. }));
    }

    #[test]
    fn test_peer_id_display() {
        let peer = PeerId::new("peer1:5000");
        assert_eq!(peer.to_string(), "peer1:5000");
        assert_eq!(PeerId::from("peer1:5000"), peer);
    }
}
