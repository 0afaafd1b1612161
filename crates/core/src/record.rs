//! The record model: keyed CRDT states with producer-assigned timestamps.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Timestamps are assigned by the producing node's [`Clock`] and are
/// monotonically non-decreasing within a process.
pub type Timestamp = u64;

/// One keyed state at a point in time.
///
/// Records with the same key are always mergeable through the CRDT
/// contract; nothing in the core ever inspects `state` directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<K, S> {
    /// The key, opaque to the core.
    pub key: K,
    /// The CRDT state carried by this record.
    pub state: S,
    /// When the producer observed this state.
    pub timestamp: Timestamp,
}

impl<K, S> Record<K, S> {
    /// Create a record.
    pub fn new(key: K, state: S, timestamp: Timestamp) -> Self {
        Record {
            key,
            state,
            timestamp,
        }
    }
}

/// A deletion marker. Survives merges until compaction retires it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone<K> {
    /// The removed key.
    pub key: K,
    /// When the removal was issued.
    pub timestamp: Timestamp,
}

impl<K> Tombstone<K> {
    /// Create a tombstone.
    pub fn new(key: K, timestamp: Timestamp) -> Self {
        Tombstone { key, timestamp }
    }
}

/// Wall-clock timestamp source, clamped to be non-decreasing.
///
/// If the OS clock steps backwards, `now()` keeps returning the highest
/// value handed out so far instead of going back in time. Regressions
/// across process restarts are accepted; merge idempotence bounds the
/// damage to stale-looking updates.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicU64,
}

impl Clock {
    /// Create a clock starting from the current wall time.
    pub fn new() -> Self {
        Clock {
            last: AtomicU64::new(0),
        }
    }

    /// Current timestamp, never below any previously returned value.
    pub fn now(&self) -> Timestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let prev = self.last.fetch_max(wall, Ordering::SeqCst);
        prev.max(wall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_non_decreasing() {
        let clock = Clock::new();
        let mut prev = 0;
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn record_roundtrip() {
        let record = Record::new(7i64, vec![1u8, 2, 3], 42);
        let bytes = bincode::serialize(&record).unwrap();
        let back: Record<i64, Vec<u8>> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, back);
    }
}
