//! Per-node protocol configuration.
//!
//! A [`KadConfig`] is fixed at node construction and shared by the routing
//! table, the liveness supervisor and the node core. The defaults reproduce
//! the classic small-network parameters: 128-bit identifiers, buckets of 20,
//! lookup parallelism 3.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default identifier width in bits (and bucket count).
pub const DEFAULT_ID_LENGTH: u32 = 128;

/// Default per-bucket capacity (the Kademlia `k` parameter).
pub const DEFAULT_K: usize = 20;

/// Default lookup parallelism (the Kademlia `alpha` parameter).
pub const DEFAULT_ALPHA: usize = 3;

/// Default expiry for an outstanding PING, in seconds.
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 3;

/// Default expiry for an outstanding FIND_NODE, in seconds.
pub const DEFAULT_FIND_NODE_TIMEOUT_SECS: u64 = 3;

/// Default period of the insertion-pool scanner, in seconds.
pub const DEFAULT_POOL_SCAN_SECS: u64 = 1;

/// Errors raised by [`KadConfig::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The identifier width is outside the supported range.
    #[error("id length {0} out of range (1..=128 bits)")]
    IdLength(u32),

    /// The bucket capacity is zero.
    #[error("bucket capacity k must be at least 1")]
    BucketCapacity,

    /// The lookup parallelism is zero.
    #[error("lookup parallelism alpha must be at least 1")]
    Parallelism,

    /// A timer parameter is zero.
    #[error("{0} must be at least 1 second")]
    Timer(&'static str),
}

/// Immutable protocol configuration, fixed at node construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KadConfig {
    /// Identifier width in bits. Also the number of buckets per routing table.
    pub id_length: u32,
    /// Per-bucket capacity.
    pub k: usize,
    /// Concurrency of iterative lookups. Consumed by the bootstrap refresh
    /// round; the full iterative machinery sits above this layer.
    pub alpha: usize,
    /// Expiry for an outstanding PING, in seconds.
    pub ping_timeout_secs: u64,
    /// Expiry for an outstanding FIND_NODE, in seconds.
    pub find_node_timeout_secs: u64,
    /// Period of the insertion-pool scanner, in seconds.
    pub pool_scan_secs: u64,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            id_length: DEFAULT_ID_LENGTH,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            ping_timeout_secs: DEFAULT_PING_TIMEOUT_SECS,
            find_node_timeout_secs: DEFAULT_FIND_NODE_TIMEOUT_SECS,
            pool_scan_secs: DEFAULT_POOL_SCAN_SECS,
        }
    }
}

impl KadConfig {
    /// Validate the parameter set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_length == 0 || self.id_length > 128 {
            return Err(ConfigError::IdLength(self.id_length));
        }
        if self.k == 0 {
            return Err(ConfigError::BucketCapacity);
        }
        if self.alpha == 0 {
            return Err(ConfigError::Parallelism);
        }
        if self.ping_timeout_secs == 0 {
            return Err(ConfigError::Timer("ping timeout"));
        }
        if self.find_node_timeout_secs == 0 {
            return Err(ConfigError::Timer("find-node timeout"));
        }
        if self.pool_scan_secs == 0 {
            return Err(ConfigError::Timer("pool scan period"));
        }
        Ok(())
    }

    /// Expiry for an outstanding PING.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Expiry for an outstanding FIND_NODE.
    pub fn find_node_timeout(&self) -> Duration {
        Duration::from_secs(self.find_node_timeout_secs)
    }

    /// Period of the insertion-pool scanner.
    pub fn pool_scan_period(&self) -> Duration {
        Duration::from_secs(self.pool_scan_secs)
    }

    /// Period of the outstanding-PING expiry scanner.
    ///
    /// A third of the PING timeout, so an expired record is noticed well
    /// before a second timeout interval elapses.
    pub fn supervisor_scan_period(&self) -> Duration {
        self.ping_timeout() / 3
    }
}
