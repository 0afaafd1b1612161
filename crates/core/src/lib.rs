//! Core types and contracts for the Conflux storage system.
//!
//! This crate defines everything the other layers agree on:
//! - Record / Tombstone / Timestamp: the data model, with a monotonic Clock
//! - CrdtFunction: the merge/extract contract, plus the reference
//!   constructions (GSet, Lww)
//! - RecordCodec: the serialization seam (BincodeCodec by default)
//! - CrdtStore: the session-based storage surface every store implements
//! - Error: the workspace-wide error taxonomy
//! - Configuration structs for the WAL, cluster, network, and repair layers
//!
//! Nothing in this crate performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod crdt;
pub mod error;
pub mod record;
pub mod store;

pub use codec::{BincodeCodec, RecordCodec};
pub use config::{
    ClusterConfig, CompressionMethod, NetConfig, QuorumPolicy, RepairConfig, StoreConfig,
    WalConfig,
};
pub use crdt::{CrdtFunction, CrdtKey, CrdtState, GSet, GSetCrdt, Lww, LwwCrdt};
pub use error::{Error, PartitionFailure, Result};
pub use record::{Clock, Record, Timestamp, Tombstone};
pub use store::{
    pipe, BoxRecordSink, BoxRecordSource, BoxTombstoneSink, CrdtStore, RecordSink, RecordSource,
    TombstoneSink,
};
