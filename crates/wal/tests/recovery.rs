//! Write-ahead log crash-recovery and handoff behavior.

use async_trait::async_trait;
use conflux_core::{
    BincodeCodec, BoxRecordSink, BoxRecordSource, BoxTombstoneSink, CrdtStore, Error, GSet,
    GSetCrdt, Record, RecordCodec, RecordSource, Result, Timestamp, WalConfig,
};
use conflux_store::MemoryStore;
use conflux_wal::{SegmentName, WriteAheadLog};
use conflux_wire::frame::encode_frame;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

type Crdt = GSetCrdt<i64, i64>;
type Wal = WriteAheadLog<Crdt, BincodeCodec>;

fn set(elems: impl IntoIterator<Item = i64>) -> GSet<i64> {
    GSet::of(elems)
}

/// The five canonical records used across these tests.
fn sample_records() -> Vec<Record<i64, GSet<i64>>> {
    vec![
        Record::new(1, set([1, 2, 3]), 100),
        Record::new(2, set([-12, 0, 200]), 101),
        Record::new(1, set([1, 6]), 102),
        Record::new(2, set([2, 3, 100]), 103),
        Record::new(1, set([9, 10, 11]), 104),
    ]
}

fn write_sealed_segment(
    dir: &Path,
    sequence: u64,
    records: &[Record<i64, GSet<i64>>],
) -> Vec<u8> {
    let codec = BincodeCodec;
    let mut bytes = Vec::new();
    for record in records {
        let payload = codec.encode(record).unwrap();
        bytes.extend(encode_frame(&payload));
    }
    let name = SegmentName::open("node-a", sequence).sealed();
    std::fs::write(name.path_in(dir), &bytes).unwrap();
    bytes
}

async fn open_wal(dir: &Path, store: Arc<dyn CrdtStore<Crdt>>, config: WalConfig) -> Wal {
    WriteAheadLog::open(dir, "node-a", config, BincodeCodec, store)
        .await
        .unwrap()
}

async fn download_all(store: &MemoryStore<Crdt>) -> Vec<Record<i64, GSet<i64>>> {
    let mut source = store.download(None).await.unwrap();
    let mut records = Vec::new();
    while let Some(record) = source.next().await.unwrap() {
        records.push(record);
    }
    records
}

fn segment_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn flush_hands_merged_records_to_storage() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new(GSetCrdt::new());
    let wal = open_wal(dir.path(), Arc::new(store.clone()), WalConfig::default()).await;
    wal.start().await.unwrap();

    for record in sample_records() {
        wal.put(record.key, record.state).await.unwrap();
    }
    wal.flush().await.unwrap();

    let records = download_all(&store).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key, 1);
    assert_eq!(records[0].state, set([1, 2, 3, 6, 9, 10, 11]));
    assert_eq!(records[1].key, 2);
    assert_eq!(records[1].state, set([-12, 0, 2, 3, 100, 200]));
}

#[tokio::test]
async fn start_drains_sealed_segments_and_leaves_one_open() {
    let dir = TempDir::new().unwrap();
    let samples = sample_records();
    write_sealed_segment(dir.path(), 0, &samples[..3]);
    write_sealed_segment(dir.path(), 1, &samples[3..]);

    let store = MemoryStore::new(GSetCrdt::new());
    let wal = open_wal(dir.path(), Arc::new(store.clone()), WalConfig::default()).await;
    let summary = wal.start().await.unwrap();
    assert_eq!(summary.segments, 2);
    assert_eq!(summary.records, 5);

    // Both sealed segments consumed; only the freshly opened segment remains.
    let files = segment_files(dir.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with(".wal"), "unexpected files: {files:?}");

    let records = download_all(&store).await;
    assert_eq!(records[0].state, set([1, 2, 3, 6, 9, 10, 11]));
    assert_eq!(records[1].state, set([-12, 0, 2, 3, 100, 200]));
}

#[tokio::test]
async fn malformed_tail_keeps_valid_prefix() {
    let dir = TempDir::new().unwrap();
    let codec = BincodeCodec;
    let records = vec![
        Record::new(1, set([1]), 10),
        Record::new(2, set([2]), 11),
        Record::new(3, set([3]), 12),
        Record::new(4, set([4]), 13),
    ];

    let mut bytes = Vec::new();
    let mut third_boundary = 0;
    for (i, record) in records.iter().enumerate() {
        let payload = codec.encode(record).unwrap();
        bytes.extend(encode_frame(&payload));
        if i == 2 {
            third_boundary = bytes.len();
        }
    }
    // Cut strictly inside the fourth frame.
    let cut = third_boundary + (bytes.len() - third_boundary) / 2;
    assert!(cut > third_boundary && cut < bytes.len());
    bytes.truncate(cut);
    let name = SegmentName::open("node-a", 0).sealed();
    std::fs::write(name.path_in(dir.path()), &bytes).unwrap();

    let store = MemoryStore::new(GSetCrdt::new());
    let wal = open_wal(dir.path(), Arc::new(store.clone()), WalConfig::default()).await;
    let summary = wal.start().await.unwrap();
    assert_eq!(summary.records, 3);

    let recovered = download_all(&store).await;
    assert_eq!(
        recovered.iter().map(|r| r.key).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn crash_without_flush_recovers_through_open_segment() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new(GSetCrdt::new());
    {
        let wal = open_wal(dir.path(), Arc::new(store.clone()), WalConfig::default()).await;
        wal.start().await.unwrap();
        wal.put(7, set([70, 71])).await.unwrap();
        wal.put(8, set([80])).await.unwrap();
        // dropped without flush or stop: simulates a crash
    }
    assert!(download_all(&store).await.is_empty());

    let store2 = MemoryStore::new(GSetCrdt::new());
    let wal = open_wal(dir.path(), Arc::new(store2.clone()), WalConfig::default()).await;
    let summary = wal.start().await.unwrap();
    assert_eq!(summary.records, 2);
    let recovered = download_all(&store2).await;
    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[0].state, set([70, 71]));
}

#[tokio::test]
async fn size_rotation_seals_and_drains() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new(GSetCrdt::new());
    let config = WalConfig {
        segment_size: 1, // every put rotates
        ..WalConfig::default()
    };
    let wal = open_wal(dir.path(), Arc::new(store.clone()), config).await;
    wal.start().await.unwrap();

    wal.put(1, set([1])).await.unwrap();
    wal.put(1, set([2])).await.unwrap();
    wal.put(2, set([3])).await.unwrap();

    let records = download_all(&store).await;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].state, set([1, 2]));

    let files = segment_files(dir.path());
    assert_eq!(files.len(), 1, "only the open segment should remain");
}

#[tokio::test]
async fn stop_flushes_then_refuses_writes() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new(GSetCrdt::new());
    let wal = open_wal(dir.path(), Arc::new(store.clone()), WalConfig::default()).await;
    wal.start().await.unwrap();

    wal.put(1, set([1])).await.unwrap();
    wal.stop().await.unwrap();

    assert_eq!(download_all(&store).await.len(), 1);
    let err = wal.put(2, set([2])).await.unwrap_err();
    assert!(err.is_shutdown());
    assert!(wal.flush().await.unwrap_err().is_shutdown());
}

// ---------------------------------------------------------------------------
// handoff failure
// ---------------------------------------------------------------------------

struct FailingStore;

#[async_trait]
impl CrdtStore<Crdt> for FailingStore {
    async fn upload(&self) -> Result<BoxRecordSink<Crdt>> {
        Err(Error::transient("injected upload failure"))
    }

    async fn download(&self, _cutoff: Option<Timestamp>) -> Result<BoxRecordSource<Crdt>> {
        Err(Error::transient("injected download failure"))
    }

    async fn remove(&self) -> Result<BoxTombstoneSink<Crdt>> {
        Err(Error::transient("injected remove failure"))
    }

    async fn size(&self) -> Result<u64> {
        Ok(0)
    }
}

#[tokio::test]
async fn failed_handoff_retains_segment_for_retry() {
    let dir = TempDir::new().unwrap();
    let samples = sample_records();
    write_sealed_segment(dir.path(), 0, &samples);

    // First start: the store rejects the upload, the segment must survive.
    let wal = open_wal(dir.path(), Arc::new(FailingStore), WalConfig::default()).await;
    let err = wal.start().await.unwrap_err();
    assert!(err.is_transient());
    assert!(segment_files(dir.path())
        .iter()
        .any(|f| f.ends_with(".wal.final")));

    // A later start with a healthy store drains it. Replay after the
    // failed attempt is safe because merge is idempotent.
    let store = MemoryStore::new(GSetCrdt::new());
    let wal = open_wal(dir.path(), Arc::new(store.clone()), WalConfig::default()).await;
    let summary = wal.start().await.unwrap();
    assert_eq!(summary.records, 5);
    assert!(!segment_files(dir.path())
        .iter()
        .any(|f| f.ends_with(".wal.final")));
    assert_eq!(download_all(&store).await.len(), 2);
}
