//! Partition-scheme discovery: resolve only when something changed.

use crate::scheme::{PartitionId, PartitionScheme};
use async_trait::async_trait;
use conflux_core::Result;
use futures::future::{pending, select_all, FutureExt};
use std::sync::Arc;

/// Supplies and refreshes the partition scheme.
///
/// `watch` takes the scheme the caller last observed and resolves only
/// once the service knows a different one (equality compares both the
/// `current` and `target` maps). The returned revision increases with
/// every change.
#[async_trait]
pub trait Discovery<P: PartitionId>: Send + Sync {
    /// Wait for a scheme differing from `prev`.
    async fn watch(&self, prev: Option<&PartitionScheme<P>>) -> Result<(PartitionScheme<P>, u64)>;
}

/// A discovery service pinned to one scheme: the first `watch` resolves
/// immediately, every later one pends forever.
pub struct ConstantDiscovery<P: Ord> {
    scheme: PartitionScheme<P>,
}

impl<P: PartitionId> ConstantDiscovery<P> {
    /// Wrap a fixed scheme.
    pub fn new(scheme: PartitionScheme<P>) -> Self {
        ConstantDiscovery { scheme }
    }
}

#[async_trait]
impl<P: PartitionId> Discovery<P> for ConstantDiscovery<P> {
    async fn watch(&self, prev: Option<&PartitionScheme<P>>) -> Result<(PartitionScheme<P>, u64)> {
        match prev {
            Some(seen) if *seen == self.scheme => pending().await,
            _ => Ok((self.scheme.clone(), 0)),
        }
    }
}

/// The union of several discovery services: whichever reports a change
/// first wins. Composite RPC strategies expose their children's
/// discovery this way.
pub struct UnionDiscovery<P> {
    services: Vec<Arc<dyn Discovery<P>>>,
}

impl<P: PartitionId> UnionDiscovery<P> {
    /// Combine services; an empty union never resolves.
    pub fn new(services: Vec<Arc<dyn Discovery<P>>>) -> Self {
        UnionDiscovery { services }
    }
}

#[async_trait]
impl<P: PartitionId> Discovery<P> for UnionDiscovery<P> {
    async fn watch(&self, prev: Option<&PartitionScheme<P>>) -> Result<(PartitionScheme<P>, u64)> {
        if self.services.is_empty() {
            return pending().await;
        }
        let watchers = self
            .services
            .iter()
            .map(|service| service.watch(prev).boxed())
            .collect::<Vec<_>>();
        let (result, _, _) = select_all(watchers).await;
        result
    }
}
