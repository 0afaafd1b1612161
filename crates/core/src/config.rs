//! Configuration for the WAL, cluster, network, and repair layers.
//!
//! Plain serde structs with defaults. Interval and timeout fields are
//! milliseconds; accessors convert to [`Duration`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Write-ahead log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Rotate the open segment once it exceeds this many bytes.
    pub segment_size: u64,
    /// Rotate a dirty segment after this much wall-clock time.
    pub rotation_interval_ms: u64,
    /// Fsync after every append. Off by default: a resolved put is then
    /// in the OS write buffer but not necessarily on media.
    pub sync_on_put: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_size: 16 * 1024 * 1024,
            rotation_interval_ms: 10_000,
            sync_on_put: false,
        }
    }
}

impl WalConfig {
    /// Rotation interval as a [`Duration`].
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms)
    }
}

/// How many replica acknowledgements a write needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    /// W = R: every selected replica must ack. The default.
    Strict,
    /// W = ⌈R/2⌉ + 1.
    Majority,
    /// A fixed W, clamped to `1..=R`.
    Fixed(usize),
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        QuorumPolicy::Strict
    }
}

impl QuorumPolicy {
    /// Required acks for a given replication factor.
    pub fn required(&self, replication: usize) -> usize {
        match *self {
            QuorumPolicy::Strict => replication,
            QuorumPolicy::Majority => replication / 2 + 1,
            QuorumPolicy::Fixed(w) => w.clamp(1, replication),
        }
    }
}

/// Cluster replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of partitions each key is replicated to.
    pub replication_factor: usize,
    /// Write quorum policy.
    pub quorum: QuorumPolicy,
    /// How long a peer stays DEAD before the next use probes it.
    pub peer_cooldown_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            replication_factor: 1,
            quorum: QuorumPolicy::Strict,
            peer_cooldown_ms: 10_000,
        }
    }
}

impl ClusterConfig {
    /// Peer cooldown as a [`Duration`].
    pub fn peer_cooldown(&self) -> Duration {
        Duration::from_millis(self.peer_cooldown_ms)
    }

    /// Validate against the number of partitions in the current scheme.
    /// Violations are fatal configuration errors.
    pub fn validate(&self, partitions: usize) -> Result<()> {
        if self.replication_factor < 1 {
            return Err(Error::fatal("replication_factor must be at least 1"));
        }
        if self.replication_factor > partitions {
            return Err(Error::fatal(format!(
                "replication_factor {} exceeds partition count {}",
                self.replication_factor, partitions
            )));
        }
        Ok(())
    }
}

/// Network client/server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Connect timeout.
    pub connect_timeout_ms: u64,
    /// Per-operation read/write timeout.
    pub read_write_timeout_ms: u64,
    /// Idle pooled connections expire after this long.
    pub keep_alive_timeout_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            connect_timeout_ms: 5_000,
            read_write_timeout_ms: 30_000,
            keep_alive_timeout_ms: 60_000,
        }
    }
}

impl NetConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read/write timeout as a [`Duration`].
    pub fn read_write_timeout(&self) -> Duration {
        Duration::from_millis(self.read_write_timeout_ms)
    }

    /// Keep-alive timeout as a [`Duration`].
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }
}

/// Anti-entropy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Minimum delay between repair cycles.
    pub interval_ms: u64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        RepairConfig {
            interval_ms: 60_000,
        }
    }
}

impl RepairConfig {
    /// Repair interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Block compression methods carried in the wire/chunk block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    /// Store bytes as-is.
    None,
    /// LZ4 block compression.
    Lz4,
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::None
    }
}

/// Local chunk-store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Compression applied to chunk blocks.
    pub compression: CompressionMethod,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_required() {
        assert_eq!(QuorumPolicy::Strict.required(3), 3);
        assert_eq!(QuorumPolicy::Majority.required(3), 2);
        assert_eq!(QuorumPolicy::Majority.required(4), 3);
        assert_eq!(QuorumPolicy::Fixed(2).required(3), 2);
        assert_eq!(QuorumPolicy::Fixed(9).required(3), 3);
        assert_eq!(QuorumPolicy::Fixed(0).required(3), 1);
    }

    #[test]
    fn cluster_config_validation() {
        let mut config = ClusterConfig {
            replication_factor: 3,
            ..Default::default()
        };
        assert!(config.validate(4).is_ok());
        assert!(config.validate(2).unwrap_err().is_fatal());
        config.replication_factor = 0;
        assert!(config.validate(4).unwrap_err().is_fatal());
    }
}
