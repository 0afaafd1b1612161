//! Chunk files: key-sorted runs of records and tombstones.
//!
//! A chunk is a block stream (optionally compressed) of codec-encoded
//! [`ChunkEntry`] frames, written to `<id>.tmp` and renamed into place.
//! Chunk ids are dense integers handed out by [`IdGenerator`], whose
//! counter file is persisted before an id is ever used.

use conflux_core::{CompressionMethod, Error, Record, RecordCodec, Result, Tombstone};
use conflux_wire::{BlockReader, BlockWriter};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::BufReader;

/// One frame of a chunk: a merged record or a deletion marker.
/// Tombstones are preserved until compaction retires them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkEntry<K, S> {
    /// A live, merged state.
    Record(Record<K, S>),
    /// A deletion marker.
    Tombstone(Tombstone<K>),
}

impl<K, S> ChunkEntry<K, S> {
    /// The entry's key.
    pub fn key(&self) -> &K {
        match self {
            ChunkEntry::Record(record) => &record.key,
            ChunkEntry::Tombstone(tombstone) => &tombstone.key,
        }
    }
}

/// File name of a chunk: the decimal id, nothing else.
pub fn chunk_path(root: &Path, id: u64) -> PathBuf {
    root.join(id.to_string())
}

/// Write a chunk atomically: temp file, sync, rename.
pub async fn write_chunk<K: Serialize, S: Serialize, C: RecordCodec>(
    root: &Path,
    id: u64,
    entries: &[ChunkEntry<K, S>],
    codec: &C,
    compression: CompressionMethod,
) -> Result<PathBuf> {
    let tmp = root.join(format!("{id}.tmp"));
    let path = chunk_path(root, id);
    let file = File::create(&tmp).await?;
    let mut writer = BlockWriter::new(file, compression);
    for entry in entries {
        let payload = codec.encode(entry)?;
        writer.write_frame(&payload).await?;
    }
    writer.finish().await?;
    let file = writer.into_inner();
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}

/// Sequential reader over one chunk's entries.
pub struct ChunkCursor<K, S, C: RecordCodec> {
    reader: BlockReader<BufReader<File>>,
    codec: C,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K: DeserializeOwned, S: DeserializeOwned, C: RecordCodec> ChunkCursor<K, S, C> {
    /// Open a chunk file.
    pub async fn open(path: &Path, codec: C) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(ChunkCursor {
            reader: BlockReader::new(BufReader::new(file)),
            codec,
            _marker: PhantomData,
        })
    }

    /// Next entry, or `None` at end of chunk.
    pub async fn next(&mut self) -> Result<Option<ChunkEntry<K, S>>> {
        match self.reader.next_frame().await? {
            Some(payload) => Ok(Some(self.codec.decode(&payload)?)),
            None => Ok(None),
        }
    }
}

/// Dense chunk-id allocator backed by a counter file.
///
/// The counter is written before an allocated id is returned, so a crash
/// between allocation and chunk install can waste an id but never reuse
/// one. An unparsable counter file is unrecoverable corruption.
#[derive(Debug)]
pub struct IdGenerator {
    path: PathBuf,
    next: u64,
}

/// Name of the counter file inside a storage root.
pub const ID_FILE: &str = "chunk.id";

impl IdGenerator {
    /// Load the counter, starting no lower than `floor` (the scan of
    /// existing chunk files guards against a lost counter write).
    pub async fn load(root: &Path, floor: u64) -> Result<Self> {
        let path = root.join(ID_FILE);
        let next = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::fatal_with("corrupted chunk id-generator state", e))?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(IdGenerator {
            path,
            next: next.max(floor),
        })
    }

    /// Allocate the next id, persisting the counter first.
    pub async fn allocate(&mut self) -> Result<u64> {
        let id = self.next;
        self.next += 1;
        tokio::fs::write(&self.path, format!("{}\n", self.next)).await?;
        Ok(id)
    }
}
