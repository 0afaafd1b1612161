//! Chunked on-disk store.
//!
//! Each finished upload or remove session becomes one key-sorted chunk
//! file. Downloads merge every live chunk with a k-way key-ordered merge,
//! applying the CRDT merge on key collisions and honoring tombstones.
//! Compaction rewrites all chunks into one and retires tombstones at or
//! below a retention horizon.

use crate::chunk::{chunk_path, write_chunk, ChunkCursor, ChunkEntry, IdGenerator};
use crate::stats::{StoreStats, StoreStatsSnapshot};
use async_trait::async_trait;
use conflux_core::{
    BoxRecordSink, BoxRecordSource, BoxTombstoneSink, CrdtFunction, CrdtStore, Record,
    RecordCodec, RecordSink, RecordSource, Result, StoreConfig, Timestamp, Tombstone,
    TombstoneSink,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

struct Inner<F: CrdtFunction, C: RecordCodec> {
    crdt: F,
    codec: C,
    root: PathBuf,
    config: StoreConfig,
    chunks: RwLock<BTreeSet<u64>>,
    idgen: tokio::sync::Mutex<IdGenerator>,
    stats: Arc<StoreStats>,
}

/// Store materialized as chunk files under a storage root.
pub struct DiskStore<F: CrdtFunction, C: RecordCodec> {
    inner: Arc<Inner<F, C>>,
}

impl<F: CrdtFunction, C: RecordCodec> Clone for DiskStore<F, C> {
    fn clone(&self) -> Self {
        DiskStore {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: CrdtFunction, C: RecordCodec> DiskStore<F, C> {
    /// Open (or create) a store under `root`. Leftover temp files from a
    /// crashed install are deleted; live chunks are discovered by name.
    pub async fn open(
        root: impl Into<PathBuf>,
        crdt: F,
        codec: C,
        config: StoreConfig,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut chunks = BTreeSet::new();
        let mut floor = 0u64;
        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(id) = name.parse::<u64>() {
                chunks.insert(id);
                floor = floor.max(id + 1);
            } else if name.ends_with(".tmp") {
                debug!(file = name, "removing orphaned chunk temp file");
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        let idgen = IdGenerator::load(&root, floor).await?;

        Ok(DiskStore {
            inner: Arc::new(Inner {
                crdt,
                codec,
                root,
                config,
                chunks: RwLock::new(chunks),
                idgen: tokio::sync::Mutex::new(idgen),
                stats: Arc::new(StoreStats::default()),
            }),
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Number of live chunk files.
    pub fn chunk_count(&self) -> usize {
        self.inner.chunks.read().len()
    }

    /// Merge every chunk into one, dropping dead states and retiring
    /// tombstones at or below `tombstone_horizon`.
    pub async fn consolidate(&self, tombstone_horizon: Timestamp) -> Result<()> {
        let old: Vec<u64> = self.inner.chunks.read().iter().copied().collect();
        if old.is_empty() {
            return Ok(());
        }

        let mut merge = self.open_merge(&old).await?;
        let mut entries: Vec<ChunkEntry<F::Key, F::State>> = Vec::new();
        while let Some((key, state, tombstone)) = merge.next_key(&self.inner.crdt).await? {
            let dead = is_dead(&state, tombstone);
            if let Some((merged, timestamp)) = state {
                if !dead {
                    entries.push(ChunkEntry::Record(Record::new(key.clone(), merged, timestamp)));
                }
            }
            if let Some(at) = tombstone {
                if at > tombstone_horizon {
                    entries.push(ChunkEntry::Tombstone(Tombstone::new(key, at)));
                }
            }
        }

        let new_id = if entries.is_empty() {
            None
        } else {
            let id = self.inner.idgen.lock().await.allocate().await?;
            write_chunk(
                &self.inner.root,
                id,
                &entries,
                &self.inner.codec,
                self.inner.config.compression,
            )
            .await?;
            Some(id)
        };

        {
            let mut set = self.inner.chunks.write();
            for id in &old {
                set.remove(id);
            }
            if let Some(id) = new_id {
                set.insert(id);
            }
        }
        for id in &old {
            tokio::fs::remove_file(chunk_path(&self.inner.root, *id)).await?;
        }
        info!(
            compacted = old.len(),
            entries = entries.len(),
            "chunks consolidated"
        );
        Ok(())
    }

    async fn open_merge(&self, ids: &[u64]) -> Result<ChunkMerge<F, C>> {
        let mut cursors = Vec::with_capacity(ids.len());
        for id in ids {
            let path = chunk_path(&self.inner.root, *id);
            let cursor = ChunkCursor::open(&path, self.inner.codec.clone()).await?;
            let mut peeked = PeekedCursor { cursor, head: None };
            peeked.refill().await?;
            cursors.push(peeked);
        }
        Ok(ChunkMerge { cursors })
    }
}

fn is_dead<S>(state: &Option<(S, Timestamp)>, tombstone: Option<Timestamp>) -> bool {
    match (state, tombstone) {
        (None, _) => true,
        (Some((_, timestamp)), Some(at)) => at >= *timestamp,
        (Some(_), None) => false,
    }
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> CrdtStore<F> for DiskStore<F, C> {
    async fn upload(&self) -> Result<BoxRecordSink<F>> {
        Ok(Box::new(ChunkUploadSink {
            inner: Arc::clone(&self.inner),
            merged: BTreeMap::new(),
            pushed: 0,
        }))
    }

    async fn download(&self, cutoff: Option<Timestamp>) -> Result<BoxRecordSource<F>> {
        let ids: Vec<u64> = self.inner.chunks.read().iter().copied().collect();
        let merge = self.open_merge(&ids).await?;
        self.inner.stats.record_download(0);
        Ok(Box::new(ChunkMergeSource {
            crdt: self.inner.crdt.clone(),
            merge,
            cutoff: cutoff.unwrap_or(0),
            stats: Some(Arc::clone(&self.inner.stats)),
        }))
    }

    async fn remove(&self) -> Result<BoxTombstoneSink<F>> {
        Ok(Box::new(ChunkRemoveSink {
            inner: Arc::clone(&self.inner),
            merged: BTreeMap::new(),
            pushed: 0,
        }))
    }

    async fn size(&self) -> Result<u64> {
        let ids: Vec<u64> = self.inner.chunks.read().iter().copied().collect();
        let merge = self.open_merge(&ids).await?;
        let mut source = ChunkMergeSource {
            crdt: self.inner.crdt.clone(),
            merge,
            cutoff: 0,
            stats: None,
        };
        let mut count = 0u64;
        while RecordSource::<F>::next(&mut source).await?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

struct ChunkUploadSink<F: CrdtFunction, C: RecordCodec> {
    inner: Arc<Inner<F, C>>,
    merged: BTreeMap<F::Key, (F::State, Timestamp)>,
    pushed: u64,
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> RecordSink<F> for ChunkUploadSink<F, C> {
    async fn push(&mut self, record: Record<F::Key, F::State>) -> Result<()> {
        self.pushed += 1;
        match self.merged.entry(record.key) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert((record.state, record.timestamp));
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                let (existing, timestamp) = slot.get_mut();
                let merged = self
                    .inner
                    .crdt
                    .merge(existing.clone(), record.state);
                *existing = merged;
                *timestamp = (*timestamp).max(record.timestamp);
            }
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        if self.merged.is_empty() {
            return Ok(());
        }
        let entries: Vec<ChunkEntry<F::Key, F::State>> = self
            .merged
            .into_iter()
            .map(|(key, (state, timestamp))| {
                ChunkEntry::Record(Record::new(key, state, timestamp))
            })
            .collect();
        let id = self.inner.idgen.lock().await.allocate().await?;
        write_chunk(
            &self.inner.root,
            id,
            &entries,
            &self.inner.codec,
            self.inner.config.compression,
        )
        .await?;
        self.inner.chunks.write().insert(id);
        self.inner.stats.record_upload(self.pushed);
        debug!(chunk = id, records = entries.len(), "chunk installed");
        Ok(())
    }
}

struct ChunkRemoveSink<F: CrdtFunction, C: RecordCodec> {
    inner: Arc<Inner<F, C>>,
    merged: BTreeMap<F::Key, Timestamp>,
    pushed: u64,
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> TombstoneSink<F> for ChunkRemoveSink<F, C> {
    async fn push(&mut self, tombstone: Tombstone<F::Key>) -> Result<()> {
        self.pushed += 1;
        let at = self
            .merged
            .get(&tombstone.key)
            .map_or(tombstone.timestamp, |existing| {
                (*existing).max(tombstone.timestamp)
            });
        self.merged.insert(tombstone.key, at);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        if self.merged.is_empty() {
            return Ok(());
        }
        let entries: Vec<ChunkEntry<F::Key, F::State>> = self
            .merged
            .into_iter()
            .map(|(key, at)| ChunkEntry::Tombstone(Tombstone::new(key, at)))
            .collect();
        let id = self.inner.idgen.lock().await.allocate().await?;
        write_chunk(
            &self.inner.root,
            id,
            &entries,
            &self.inner.codec,
            self.inner.config.compression,
        )
        .await?;
        self.inner.chunks.write().insert(id);
        self.inner.stats.record_remove(self.pushed);
        Ok(())
    }
}

struct PeekedCursor<F: CrdtFunction, C: RecordCodec> {
    cursor: ChunkCursor<F::Key, F::State, C>,
    head: Option<ChunkEntry<F::Key, F::State>>,
}

impl<F: CrdtFunction, C: RecordCodec> PeekedCursor<F, C> {
    async fn refill(&mut self) -> Result<()> {
        self.head = self.cursor.next().await?;
        Ok(())
    }
}

struct ChunkMerge<F: CrdtFunction, C: RecordCodec> {
    cursors: Vec<PeekedCursor<F, C>>,
}

impl<F: CrdtFunction, C: RecordCodec> ChunkMerge<F, C> {
    /// Fold every entry carrying the smallest pending key into a merged
    /// state and a tombstone timestamp, advancing the cursors involved.
    #[allow(clippy::type_complexity)]
    async fn next_key(
        &mut self,
        crdt: &F,
    ) -> Result<Option<(F::Key, Option<(F::State, Timestamp)>, Option<Timestamp>)>> {
        let key = self
            .cursors
            .iter()
            .filter_map(|c| c.head.as_ref().map(|e| e.key()))
            .min()
            .cloned();
        let Some(key) = key else {
            return Ok(None);
        };

        let mut state: Option<(F::State, Timestamp)> = None;
        let mut tombstone: Option<Timestamp> = None;
        for cursor in &mut self.cursors {
            loop {
                let matches = matches!(&cursor.head, Some(entry) if *entry.key() == key);
                if !matches {
                    break;
                }
                if let Some(entry) = cursor.head.take() {
                    match entry {
                        ChunkEntry::Record(record) => {
                            state = Some(match state.take() {
                                Some((existing, timestamp)) => (
                                    crdt.merge(existing, record.state),
                                    timestamp.max(record.timestamp),
                                ),
                                None => (record.state, record.timestamp),
                            });
                        }
                        ChunkEntry::Tombstone(t) => {
                            tombstone =
                                Some(tombstone.map_or(t.timestamp, |at| at.max(t.timestamp)));
                        }
                    }
                }
                cursor.refill().await?;
            }
        }
        Ok(Some((key, state, tombstone)))
    }
}

struct ChunkMergeSource<F: CrdtFunction, C: RecordCodec> {
    crdt: F,
    merge: ChunkMerge<F, C>,
    cutoff: Timestamp,
    stats: Option<Arc<StoreStats>>,
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> RecordSource<F> for ChunkMergeSource<F, C> {
    async fn next(&mut self) -> Result<Option<Record<F::Key, F::State>>> {
        loop {
            let Some((key, state, tombstone)) = self.merge.next_key(&self.crdt).await? else {
                return Ok(None);
            };
            if is_dead(&state, tombstone) {
                continue;
            }
            let Some((merged, timestamp)) = state else {
                continue;
            };
            if let Some(visible) = self.crdt.extract(merged, self.cutoff) {
                if let Some(stats) = &self.stats {
                    stats.record_streamed(1);
                }
                return Ok(Some(Record::new(key, visible, timestamp)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::{BincodeCodec, CompressionMethod, GSet, GSetCrdt};
    use tempfile::TempDir;

    type Crdt = GSetCrdt<i64, i64>;

    async fn open(dir: &TempDir) -> DiskStore<Crdt, BincodeCodec> {
        DiskStore::open(
            dir.path(),
            GSetCrdt::new(),
            BincodeCodec,
            StoreConfig {
                compression: CompressionMethod::Lz4,
            },
        )
        .await
        .unwrap()
    }

    async fn upload(store: &DiskStore<Crdt, BincodeCodec>, records: Vec<Record<i64, GSet<i64>>>) {
        let mut sink = store.upload().await.unwrap();
        for record in records {
            sink.push(record).await.unwrap();
        }
        sink.finish().await.unwrap();
    }

    async fn download_all(store: &DiskStore<Crdt, BincodeCodec>) -> Vec<Record<i64, GSet<i64>>> {
        let mut source = store.download(None).await.unwrap();
        let mut records = Vec::new();
        while let Some(record) = source.next().await.unwrap() {
            records.push(record);
        }
        records
    }

    #[tokio::test]
    async fn merges_across_chunks_in_key_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        upload(
            &store,
            vec![
                Record::new(2, GSet::of([-12, 0, 200]), 10),
                Record::new(1, GSet::of([1, 2, 3]), 11),
            ],
        )
        .await;
        upload(
            &store,
            vec![
                Record::new(1, GSet::of([6, 9, 10, 11]), 12),
                Record::new(2, GSet::of([2, 3, 100]), 13),
            ],
        )
        .await;
        assert_eq!(store.chunk_count(), 2);

        let records = download_all(&store).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, 1);
        assert_eq!(records[0].state, GSet::of([1, 2, 3, 6, 9, 10, 11]));
        assert_eq!(records[1].state, GSet::of([-12, 0, 2, 3, 100, 200]));
        assert_eq!(store.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir).await;
            upload(&store, vec![Record::new(5, GSet::of([50]), 10)]).await;
        }
        let store = open(&dir).await;
        let records = download_all(&store).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, 5);
    }

    #[tokio::test]
    async fn tombstone_chunk_hides_older_records() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        upload(&store, vec![Record::new(1, GSet::of([1]), 10)]).await;

        let mut remover = store.remove().await.unwrap();
        remover.push(Tombstone::new(1, 20)).await.unwrap();
        remover.finish().await.unwrap();

        assert!(download_all(&store).await.is_empty());

        // Newer record resurrects the key.
        upload(&store, vec![Record::new(1, GSet::of([2]), 30)]).await;
        let records = download_all(&store).await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn consolidate_compacts_and_retires_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        upload(&store, vec![Record::new(1, GSet::of([1]), 10)]).await;
        upload(&store, vec![Record::new(2, GSet::of([2]), 11)]).await;
        let mut remover = store.remove().await.unwrap();
        remover.push(Tombstone::new(1, 20)).await.unwrap();
        remover.finish().await.unwrap();
        assert_eq!(store.chunk_count(), 3);

        store.consolidate(100).await.unwrap();
        assert_eq!(store.chunk_count(), 1);

        let records = download_all(&store).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, 2);

        // The tombstone was below the horizon: a stale record for key 1
        // arriving later is no longer masked.
        upload(&store, vec![Record::new(1, GSet::of([9]), 15)]).await;
        assert_eq!(download_all(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn consolidate_keeps_recent_tombstones() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        upload(&store, vec![Record::new(1, GSet::of([1]), 10)]).await;
        let mut remover = store.remove().await.unwrap();
        remover.push(Tombstone::new(1, 50)).await.unwrap();
        remover.finish().await.unwrap();

        store.consolidate(40).await.unwrap();

        // Tombstone above the horizon still masks stale records.
        upload(&store, vec![Record::new(1, GSet::of([9]), 20)]).await;
        assert!(download_all(&store).await.is_empty());
    }

    #[tokio::test]
    async fn empty_session_writes_no_chunk() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let sink = store.upload().await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(store.chunk_count(), 0);
    }
}
