//! # Conflux
//!
//! A replicated CRDT key-value storage core: crash-safe write-ahead
//! logging in front of a merging local store, rendezvous-hashed
//! replication with quorum writes across a cluster of partitions, and
//! background anti-entropy to pull diverged replicas together.
//!
//! Keys and states are opaque; the caller supplies a merge function that
//! is commutative, associative, and idempotent, and every layer leans on
//! those laws instead of coordination.
//!
//! # Quick start
//!
//! ```no_run
//! use confluxdb::{
//!     BincodeCodec, ConstantDiscovery, CrdtStore, Endpoint, GSet, GSetCrdt, MemoryStore,
//!     Node, NodeConfig, PartitionScheme,
//! };
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! type Crdt = GSetCrdt<String, i64>;
//!
//! # async fn run() -> confluxdb::Result<()> {
//! let local: Arc<dyn CrdtStore<Crdt>> = Arc::new(MemoryStore::new(Crdt::new()));
//! let scheme = PartitionScheme::new(BTreeMap::from([(0u32, Endpoint::Local)]));
//!
//! let store = Arc::clone(&local);
//! let node = Node::new(
//!     NodeConfig::new("node-a", "./wal"),
//!     Crdt::new(),
//!     BincodeCodec,
//!     Arc::clone(&local),
//!     Arc::new(ConstantDiscovery::new(scheme)),
//!     move |_: &Endpoint| Ok(Arc::clone(&store)),
//!     Some(0u32),
//!     None,
//! )
//! .await?;
//!
//! node.start().await?;
//! node.put("visits".to_string(), GSet::of([1, 2, 3])).await?;
//! node.flush().await?;
//! node.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The member crates are re-exported here; hosts normally depend only on
//! this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod node;

pub use node::{exit_code, Node, NodeConfig, EXIT_CONFIG, EXIT_CORRUPTION, EXIT_OK};

pub use conflux_cluster::{
    ClusterStore, ConnectionPool, ConstantDiscovery, Discovery, Endpoint, FirstAvailable,
    HealthTracker, PartitionId, PartitionScheme, RemoteStore, RendezvousSharder, RepairLoop,
    RequestKind, RpcStrategy, ShardingByKey, StorageServer, StoreFactory, StoreStrategy,
    TypeDispatch, UnionDiscovery,
};
pub use conflux_core::{
    pipe, BincodeCodec, BoxRecordSink, BoxRecordSource, BoxTombstoneSink, Clock, ClusterConfig,
    CompressionMethod, CrdtFunction, CrdtKey, CrdtState, CrdtStore, Error, GSet, GSetCrdt, Lww,
    LwwCrdt, NetConfig, PartitionFailure, QuorumPolicy, Record, RecordCodec, RecordSink,
    RecordSource, RepairConfig, Result, StoreConfig, Timestamp, Tombstone, TombstoneSink,
    WalConfig,
};
pub use conflux_store::{DiskStore, MemoryStore, StoreStats, StoreStatsSnapshot};
pub use conflux_wal::{RecoverySummary, WriteAheadLog};

/// The framed transport, for hosts that speak the wire protocol
/// directly.
pub use conflux_wire as wire;
