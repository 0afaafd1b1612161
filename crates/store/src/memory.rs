//! In-memory store: a B-tree map of merged states.

use crate::stats::{StoreStats, StoreStatsSnapshot};
use async_trait::async_trait;
use conflux_core::{
    BoxRecordSink, BoxRecordSource, BoxTombstoneSink, CrdtFunction, CrdtStore, Record, RecordSink,
    RecordSource, Result, Timestamp, Tombstone, TombstoneSink,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Entry<S> {
    /// Merge-reduction of every record ingested for the key. `None` for a
    /// key known only through a tombstone.
    state: Option<S>,
    timestamp: Timestamp,
    tombstone: Option<Timestamp>,
}

impl<S> Entry<S> {
    /// A tombstone at or after the state's timestamp hides the key until
    /// a newer record resurrects it.
    fn is_dead(&self) -> bool {
        match (&self.state, self.tombstone) {
            (None, _) => true,
            (Some(_), Some(tomb)) => tomb >= self.timestamp,
            (Some(_), None) => false,
        }
    }
}

type Map<F> = BTreeMap<<F as CrdtFunction>::Key, Entry<<F as CrdtFunction>::State>>;

/// A keyed in-memory store that merges on install.
///
/// Sessions buffer their input and install it under one write lock, so a
/// concurrent download observes either none or all of an upload's
/// effects. Downloads snapshot at open and never see later sessions.
pub struct MemoryStore<F: CrdtFunction> {
    crdt: F,
    map: Arc<RwLock<Map<F>>>,
    stats: Arc<StoreStats>,
}

impl<F: CrdtFunction> Clone for MemoryStore<F> {
    fn clone(&self) -> Self {
        MemoryStore {
            crdt: self.crdt.clone(),
            map: Arc::clone(&self.map),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<F: CrdtFunction> MemoryStore<F> {
    /// Empty store over the given merge function.
    pub fn new(crdt: F) -> Self {
        MemoryStore {
            crdt,
            map: Arc::new(RwLock::new(BTreeMap::new())),
            stats: Arc::new(StoreStats::default()),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }
}

#[async_trait]
impl<F: CrdtFunction> CrdtStore<F> for MemoryStore<F> {
    async fn upload(&self) -> Result<BoxRecordSink<F>> {
        Ok(Box::new(UploadSink {
            crdt: self.crdt.clone(),
            map: Arc::clone(&self.map),
            stats: Arc::clone(&self.stats),
            buffered: Vec::new(),
        }))
    }

    async fn download(&self, cutoff: Option<Timestamp>) -> Result<BoxRecordSource<F>> {
        let cutoff = cutoff.unwrap_or(0);
        let records: Vec<Record<F::Key, F::State>> = {
            let map = self.map.read();
            map.iter()
                .filter(|(_, entry)| !entry.is_dead())
                .filter_map(|(key, entry)| {
                    let state = entry.state.clone()?;
                    self.crdt
                        .extract(state, cutoff)
                        .map(|visible| Record::new(key.clone(), visible, entry.timestamp))
                })
                .collect()
        };
        self.stats.record_download(records.len() as u64);
        Ok(Box::new(SnapshotSource {
            iter: records.into_iter(),
        }))
    }

    async fn remove(&self) -> Result<BoxTombstoneSink<F>> {
        Ok(Box::new(RemoveSink {
            map: Arc::clone(&self.map),
            stats: Arc::clone(&self.stats),
            buffered: Vec::new(),
        }))
    }

    async fn size(&self) -> Result<u64> {
        let map = self.map.read();
        Ok(map.values().filter(|entry| !entry.is_dead()).count() as u64)
    }
}

struct UploadSink<F: CrdtFunction> {
    crdt: F,
    map: Arc<RwLock<Map<F>>>,
    stats: Arc<StoreStats>,
    buffered: Vec<Record<F::Key, F::State>>,
}

#[async_trait]
impl<F: CrdtFunction> RecordSink<F> for UploadSink<F> {
    async fn push(&mut self, record: Record<F::Key, F::State>) -> Result<()> {
        self.buffered.push(record);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let count = self.buffered.len() as u64;
        {
            let mut map = self.map.write();
            for record in self.buffered {
                match map.entry(record.key) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        slot.insert(Entry {
                            state: Some(record.state),
                            timestamp: record.timestamp,
                            tombstone: None,
                        });
                    }
                    std::collections::btree_map::Entry::Occupied(mut slot) => {
                        let entry = slot.get_mut();
                        entry.state = Some(match entry.state.take() {
                            Some(existing) => self.crdt.merge(existing, record.state),
                            None => record.state,
                        });
                        entry.timestamp = entry.timestamp.max(record.timestamp);
                    }
                }
            }
        }
        self.stats.record_upload(count);
        Ok(())
    }
}

struct RemoveSink<F: CrdtFunction> {
    map: Arc<RwLock<Map<F>>>,
    stats: Arc<StoreStats>,
    buffered: Vec<Tombstone<F::Key>>,
}

#[async_trait]
impl<F: CrdtFunction> TombstoneSink<F> for RemoveSink<F> {
    async fn push(&mut self, tombstone: Tombstone<F::Key>) -> Result<()> {
        self.buffered.push(tombstone);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let count = self.buffered.len() as u64;
        {
            let mut map = self.map.write();
            for tombstone in self.buffered {
                match map.entry(tombstone.key) {
                    std::collections::btree_map::Entry::Vacant(slot) => {
                        slot.insert(Entry {
                            state: None,
                            timestamp: 0,
                            tombstone: Some(tombstone.timestamp),
                        });
                    }
                    std::collections::btree_map::Entry::Occupied(mut slot) => {
                        let entry = slot.get_mut();
                        entry.tombstone = Some(
                            entry
                                .tombstone
                                .map_or(tombstone.timestamp, |t| t.max(tombstone.timestamp)),
                        );
                    }
                }
            }
        }
        self.stats.record_remove(count);
        Ok(())
    }
}

struct SnapshotSource<F: CrdtFunction> {
    iter: std::vec::IntoIter<Record<F::Key, F::State>>,
}

#[async_trait]
impl<F: CrdtFunction> RecordSource<F> for SnapshotSource<F> {
    async fn next(&mut self) -> Result<Option<Record<F::Key, F::State>>> {
        Ok(self.iter.next())
    }
}
