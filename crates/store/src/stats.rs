//! Store counters, exposed as plain snapshots.
//!
//! The core carries no metrics runtime; observers read a snapshot and
//! export it however they like.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one store.
#[derive(Debug, Default)]
pub struct StoreStats {
    upload_sessions: AtomicU64,
    uploaded_records: AtomicU64,
    download_sessions: AtomicU64,
    downloaded_records: AtomicU64,
    removed_keys: AtomicU64,
}

impl StoreStats {
    /// Record a finished upload session of `records` records.
    pub fn record_upload(&self, records: u64) {
        self.upload_sessions.fetch_add(1, Ordering::Relaxed);
        self.uploaded_records.fetch_add(records, Ordering::Relaxed);
    }

    /// Record an opened download session of `records` records.
    pub fn record_download(&self, records: u64) {
        self.download_sessions.fetch_add(1, Ordering::Relaxed);
        self.downloaded_records.fetch_add(records, Ordering::Relaxed);
    }

    /// Record records handed to an already-counted download session.
    /// Streaming sources report incrementally instead of up front.
    pub fn record_streamed(&self, records: u64) {
        self.downloaded_records.fetch_add(records, Ordering::Relaxed);
    }

    /// Record a finished remove session of `keys` tombstones.
    pub fn record_remove(&self, keys: u64) {
        self.removed_keys.fetch_add(keys, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of all counters.
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            upload_sessions: self.upload_sessions.load(Ordering::Relaxed),
            uploaded_records: self.uploaded_records.load(Ordering::Relaxed),
            download_sessions: self.download_sessions.load(Ordering::Relaxed),
            downloaded_records: self.downloaded_records.load(Ordering::Relaxed),
            removed_keys: self.removed_keys.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`StoreStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    /// Upload sessions that reached end-of-stream.
    pub upload_sessions: u64,
    /// Records installed by those sessions.
    pub uploaded_records: u64,
    /// Download sessions opened.
    pub download_sessions: u64,
    /// Records handed to download sessions.
    pub downloaded_records: u64,
    /// Tombstones installed.
    pub removed_keys: u64,
}
