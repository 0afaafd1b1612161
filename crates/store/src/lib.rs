//! Local CRDT storage.
//!
//! Two implementations of the store surface:
//!
//! - [`MemoryStore`]: a B-tree map under a read/write lock. Upload and
//!   remove sessions buffer and install atomically at end-of-stream;
//!   downloads snapshot at open.
//! - [`DiskStore`]: key-sorted chunk files under a storage root, named
//!   by dense ids from a persisted [`IdGenerator`]. Downloads merge all
//!   live chunks with a k-way key-ordered merge; [`DiskStore::consolidate`]
//!   compacts chunks and retires old tombstones.
//!
//! Both materialize, for every key, the merge-reduction of all ingested
//! records that have not been fully tombstoned.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod disk;
pub mod memory;
pub mod stats;

pub use chunk::{ChunkEntry, IdGenerator};
pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use stats::{StoreStats, StoreStatsSnapshot};
