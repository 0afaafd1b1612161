//! Crash-safe write-ahead log.
//!
//! Every put is appended as a record frame to the current open segment
//! before it ever reaches storage. Segments rotate on flush, on a size
//! threshold, or on a wall-clock interval; a sealed segment is drained
//! into the local store through one upload session and unlinked only
//! after the session's end-of-stream acknowledgement. Delivery is
//! at-least-once; the store's merge makes replay idempotent.
//!
//! Segment files are named `<node-id>_<sequence>.wal` while open and
//! `<node-id>_<sequence>.wal.final` once sealed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod log;
pub mod segment;

pub use log::{RecoverySummary, WriteAheadLog};
pub use segment::{SegmentName, OPEN_SUFFIX, SEALED_SUFFIX};
