//! The session-based storage surface.
//!
//! Every store implements [`CrdtStore`], from the in-memory map up to
//! the whole cluster. All three operations are streaming sessions:
//!
//! - an upload session accepts records and installs them atomically when
//!   `finish()` returns (the end-of-stream acknowledgement);
//! - a download session yields records in key order, consistent as of the
//!   moment it was opened;
//! - a remove session accepts tombstones.
//!
//! Dropping an unfinished sink cancels the session: effects already
//! applied are not rolled back, but nothing further is delivered and the
//! receiving side observes an error instead of an ack.

use crate::crdt::CrdtFunction;
use crate::error::Result;
use crate::record::{Record, Timestamp, Tombstone};
use async_trait::async_trait;

/// Boxed upload session.
pub type BoxRecordSink<F> = Box<dyn RecordSink<F>>;
/// Boxed download session.
pub type BoxRecordSource<F> = Box<dyn RecordSource<F>>;
/// Boxed remove session.
pub type BoxTombstoneSink<F> = Box<dyn TombstoneSink<F>>;

/// A store of CRDT states, keyed and merged by a [`CrdtFunction`].
#[async_trait]
pub trait CrdtStore<F: CrdtFunction>: Send + Sync {
    /// Open an upload session. Records become visible to readers only
    /// after the session's `finish()` resolves.
    async fn upload(&self) -> Result<BoxRecordSink<F>>;

    /// Open a download session. With `cutoff` set, only the portion of
    /// each state visible at or after the cutoff is returned; `None`
    /// returns all live state. The stream is ordered by key.
    async fn download(&self, cutoff: Option<Timestamp>) -> Result<BoxRecordSource<F>>;

    /// Open a remove session accepting tombstones.
    async fn remove(&self) -> Result<BoxTombstoneSink<F>>;

    /// Approximate count of live keys.
    async fn size(&self) -> Result<u64>;
}

/// Receiving half of an upload session.
#[async_trait]
pub trait RecordSink<F: CrdtFunction>: Send {
    /// Deliver one record. Within a session, records are applied in
    /// arrival order.
    async fn push(&mut self, record: Record<F::Key, F::State>) -> Result<()>;

    /// End of stream. Resolves once the receiver has durably merged and
    /// acknowledged every pushed record.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Producing half of a download session.
#[async_trait]
pub trait RecordSource<F: CrdtFunction>: Send {
    /// Next record in key order, or `None` at end of stream.
    async fn next(&mut self) -> Result<Option<Record<F::Key, F::State>>>;
}

/// Receiving half of a remove session.
#[async_trait]
pub trait TombstoneSink<F: CrdtFunction>: Send {
    /// Deliver one tombstone.
    async fn push(&mut self, tombstone: Tombstone<F::Key>) -> Result<()>;

    /// End of stream; resolves on acknowledgement.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Drain a source into a sink, finishing the sink. Returns the number of
/// records moved. Used by WAL handoff and by the repair loop.
pub async fn pipe<F: CrdtFunction>(
    mut source: BoxRecordSource<F>,
    mut sink: BoxRecordSink<F>,
) -> Result<u64> {
    let mut moved = 0u64;
    while let Some(record) = source.next().await? {
        sink.push(record).await?;
        moved += 1;
    }
    sink.finish().await?;
    Ok(moved)
}
