//! Partition schemes: who stores what, and where the cluster is heading.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::net::SocketAddr;

/// Bounds a partition identifier must satisfy: stable total order (ties
/// in the sharder break by it), hashing, and a codec encoding.
pub trait PartitionId:
    Ord + Hash + Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> PartitionId for T where
    T: Ord + Hash + Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Where a partition's store lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// This node's own store.
    Local,
    /// A peer reachable over the wire protocol.
    Remote(SocketAddr),
}

/// The cluster layout. While `target` is set the cluster is rebalancing:
/// writes go to the union of both maps, reads come from `current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionScheme<P: Ord> {
    /// The serving layout.
    pub current: BTreeMap<P, Endpoint>,
    /// The layout being migrated to, when a rebalance is under way.
    pub target: Option<BTreeMap<P, Endpoint>>,
}

impl<P: PartitionId> PartitionScheme<P> {
    /// A stable scheme with no rebalance in progress.
    pub fn new(current: BTreeMap<P, Endpoint>) -> Self {
        PartitionScheme {
            current,
            target: None,
        }
    }

    /// True while a rebalance is under way.
    pub fn rebalancing(&self) -> bool {
        self.target.is_some()
    }

    /// Partitions receiving writes: the union of `current` and `target`.
    pub fn write_set(&self) -> BTreeMap<P, Endpoint> {
        let mut set = self.current.clone();
        if let Some(target) = &self.target {
            for (partition, endpoint) in target {
                set.entry(partition.clone()).or_insert(*endpoint);
            }
        }
        set
    }

    /// Partitions serving reads.
    pub fn read_set(&self) -> &BTreeMap<P, Endpoint> {
        &self.current
    }

    /// Partitions present in `current` but absent from `target`: the ones
    /// retired once the rebalance completes. Empty when not rebalancing.
    pub fn retiring(&self) -> Vec<P> {
        match &self.target {
            Some(target) => self
                .current
                .keys()
                .filter(|p| !target.contains_key(*p))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Finish a rebalance: `target` becomes `current`.
    pub fn promote_target(&mut self) {
        if let Some(target) = self.target.take() {
            self.current = target;
        }
    }
}
