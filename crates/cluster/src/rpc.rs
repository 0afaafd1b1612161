//! Request-routing strategies composed over stores.
//!
//! Thin front ends for callers that hold several cluster (or single)
//! stores: dispatch by request kind, pick the first available sender, or
//! shard by key hash. Every strategy exposes the discovery services of
//! its children so a wrapper can propagate topology changes.

use crate::discovery::Discovery;
use crate::scheme::PartitionId;
use conflux_core::{CrdtFunction, CrdtStore, Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// The class of a store request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// A record upload session.
    Upload,
    /// A record download session.
    Download,
    /// A tombstone upload session.
    Remove,
}

/// Routes a request to a store, or reports that none is available.
pub trait RpcStrategy<F: CrdtFunction, P: PartitionId>: Send + Sync {
    /// The store that should handle the request, if any. `key_bytes` is
    /// the encoded request key, when the request has one.
    fn sender(&self, kind: RequestKind, key_bytes: Option<&[u8]>)
        -> Option<Arc<dyn CrdtStore<F>>>;

    /// The discovery services feeding this strategy, for topology-change
    /// propagation. Composites return the union of their children's.
    fn discovery(&self) -> Vec<Arc<dyn Discovery<P>>>;

    /// Like [`sender`](RpcStrategy::sender), but a missing sender is an
    /// error.
    fn require_sender(
        &self,
        kind: RequestKind,
        key_bytes: Option<&[u8]>,
    ) -> Result<Arc<dyn CrdtStore<F>>> {
        self.sender(kind, key_bytes)
            .ok_or_else(|| Error::exhausted(1, 0, Vec::new()))
    }
}

/// Leaf strategy: one store (possibly absent) and its discovery service.
pub struct StoreStrategy<F: CrdtFunction, P: PartitionId> {
    store: Option<Arc<dyn CrdtStore<F>>>,
    discovery: Vec<Arc<dyn Discovery<P>>>,
}

impl<F: CrdtFunction, P: PartitionId> StoreStrategy<F, P> {
    /// A strategy backed by a store.
    pub fn new(store: Arc<dyn CrdtStore<F>>) -> Self {
        StoreStrategy {
            store: Some(store),
            discovery: Vec::new(),
        }
    }

    /// A strategy with no sender. Useful as a dispatch placeholder.
    pub fn empty() -> Self {
        StoreStrategy {
            store: None,
            discovery: Vec::new(),
        }
    }

    /// Attach a discovery service.
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery<P>>) -> Self {
        self.discovery.push(discovery);
        self
    }
}

impl<F: CrdtFunction, P: PartitionId> RpcStrategy<F, P> for StoreStrategy<F, P> {
    fn sender(
        &self,
        _kind: RequestKind,
        _key_bytes: Option<&[u8]>,
    ) -> Option<Arc<dyn CrdtStore<F>>> {
        self.store.clone()
    }

    fn discovery(&self) -> Vec<Arc<dyn Discovery<P>>> {
        self.discovery.clone()
    }
}

/// Map request kind → substrategy, with a fallback for unmapped kinds.
pub struct TypeDispatch<F: CrdtFunction, P: PartitionId> {
    routes: HashMap<RequestKind, Box<dyn RpcStrategy<F, P>>>,
    fallback: Box<dyn RpcStrategy<F, P>>,
}

impl<F: CrdtFunction, P: PartitionId> TypeDispatch<F, P> {
    /// Dispatcher sending unmapped kinds to `fallback`.
    pub fn new(fallback: impl RpcStrategy<F, P> + 'static) -> Self {
        TypeDispatch {
            routes: HashMap::new(),
            fallback: Box::new(fallback),
        }
    }

    /// Route one request kind to a dedicated strategy.
    pub fn route(mut self, kind: RequestKind, strategy: impl RpcStrategy<F, P> + 'static) -> Self {
        self.routes.insert(kind, Box::new(strategy));
        self
    }
}

impl<F: CrdtFunction, P: PartitionId> RpcStrategy<F, P> for TypeDispatch<F, P> {
    fn sender(
        &self,
        kind: RequestKind,
        key_bytes: Option<&[u8]>,
    ) -> Option<Arc<dyn CrdtStore<F>>> {
        match self.routes.get(&kind) {
            Some(strategy) => strategy.sender(kind, key_bytes),
            None => self.fallback.sender(kind, key_bytes),
        }
    }

    fn discovery(&self) -> Vec<Arc<dyn Discovery<P>>> {
        let mut services = self.fallback.discovery();
        for strategy in self.routes.values() {
            services.extend(strategy.discovery());
        }
        services
    }
}

/// Ordered list of strategies; the first with a non-null sender wins.
pub struct FirstAvailable<F: CrdtFunction, P: PartitionId> {
    strategies: Vec<Box<dyn RpcStrategy<F, P>>>,
}

impl<F: CrdtFunction, P: PartitionId> FirstAvailable<F, P> {
    /// An empty list; add candidates with [`then`](FirstAvailable::then).
    pub fn new() -> Self {
        FirstAvailable {
            strategies: Vec::new(),
        }
    }

    /// Append a candidate.
    pub fn then(mut self, strategy: impl RpcStrategy<F, P> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }
}

impl<F: CrdtFunction, P: PartitionId> Default for FirstAvailable<F, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: CrdtFunction, P: PartitionId> RpcStrategy<F, P> for FirstAvailable<F, P> {
    fn sender(
        &self,
        kind: RequestKind,
        key_bytes: Option<&[u8]>,
    ) -> Option<Arc<dyn CrdtStore<F>>> {
        self.strategies
            .iter()
            .find_map(|strategy| strategy.sender(kind, key_bytes))
    }

    fn discovery(&self) -> Vec<Arc<dyn Discovery<P>>> {
        self.strategies
            .iter()
            .flat_map(|strategy| strategy.discovery())
            .collect()
    }
}

/// Hash the request key to pick one substrategy. Requests without a key,
/// or landing on a substrategy without a sender, get no sender.
pub struct ShardingByKey<F: CrdtFunction, P: PartitionId> {
    shards: Vec<Box<dyn RpcStrategy<F, P>>>,
}

impl<F: CrdtFunction, P: PartitionId> ShardingByKey<F, P> {
    /// An empty ring; add shards with [`shard`](ShardingByKey::shard).
    pub fn new() -> Self {
        ShardingByKey { shards: Vec::new() }
    }

    /// Append a shard.
    pub fn shard(mut self, strategy: impl RpcStrategy<F, P> + 'static) -> Self {
        self.shards.push(Box::new(strategy));
        self
    }
}

impl<F: CrdtFunction, P: PartitionId> Default for ShardingByKey<F, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: CrdtFunction, P: PartitionId> RpcStrategy<F, P> for ShardingByKey<F, P> {
    fn sender(
        &self,
        kind: RequestKind,
        key_bytes: Option<&[u8]>,
    ) -> Option<Arc<dyn CrdtStore<F>>> {
        if self.shards.is_empty() {
            return None;
        }
        let key_bytes = key_bytes?;
        let index = (xxh3_64(key_bytes) % self.shards.len() as u64) as usize;
        self.shards[index].sender(kind, Some(key_bytes))
    }

    fn discovery(&self) -> Vec<Arc<dyn Discovery<P>>> {
        self.shards
            .iter()
            .flat_map(|strategy| strategy.discovery())
            .collect()
    }
}
