//! The wire protocol end to end: remote store client against the
//! storage server over localhost.

use conflux_cluster::{ConnectionPool, RemoteStore, StorageServer};
use conflux_core::{
    BincodeCodec, CompressionMethod, CrdtStore, GSet, GSetCrdt, NetConfig, Record, RecordSink,
    RecordSource, Tombstone, TombstoneSink,
};
use conflux_store::MemoryStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

type Crdt = GSetCrdt<i64, i64>;

fn set(elems: impl IntoIterator<Item = i64>) -> GSet<i64> {
    GSet::of(elems)
}

struct Harness {
    store: MemoryStore<Crdt>,
    remote: RemoteStore<Crdt, BincodeCodec>,
    pool: Arc<ConnectionPool>,
    _shutdown: watch::Sender<bool>,
}

async fn harness(compression: CompressionMethod) -> Harness {
    let store = MemoryStore::new(GSetCrdt::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = StorageServer::new(
        Arc::new(store.clone()) as Arc<dyn CrdtStore<Crdt>>,
        BincodeCodec,
        NetConfig::default(),
    );
    tokio::spawn(server.serve(listener, shutdown_rx));

    let pool = ConnectionPool::new(NetConfig::default());
    let remote = RemoteStore::new(
        addr,
        Arc::clone(&pool),
        BincodeCodec,
        NetConfig::default(),
        compression,
    );
    Harness {
        store,
        remote,
        pool,
        _shutdown: shutdown_tx,
    }
}

async fn download_all(store: &dyn CrdtStore<Crdt>) -> Vec<Record<i64, GSet<i64>>> {
    let mut source = store.download(None).await.unwrap();
    let mut records = Vec::new();
    while let Some(record) = source.next().await.unwrap() {
        records.push(record);
    }
    records
}

#[tokio::test]
async fn upload_download_roundtrip_plain() {
    let h = harness(CompressionMethod::None).await;

    let mut sink = h.remote.upload().await.unwrap();
    sink.push(Record::new(1, set([1, 2, 3]), 10)).await.unwrap();
    sink.push(Record::new(2, set([-12, 0, 200]), 11)).await.unwrap();
    sink.push(Record::new(1, set([6]), 12)).await.unwrap();
    sink.finish().await.unwrap();

    // Installed on the server's store, merged per key.
    let local = download_all(&h.store).await;
    assert_eq!(local.len(), 2);
    assert_eq!(local[0].state, set([1, 2, 3, 6]));

    // And readable back through the wire.
    let records = download_all(&h.remote).await;
    assert_eq!(records, local);
}

#[tokio::test]
async fn upload_download_roundtrip_lz4() {
    let h = harness(CompressionMethod::Lz4).await;

    let big: Vec<i64> = (0..5000).collect();
    let mut sink = h.remote.upload().await.unwrap();
    sink.push(Record::new(9, set(big.clone()), 10)).await.unwrap();
    sink.finish().await.unwrap();

    let records = download_all(&h.remote).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, set(big));
}

#[tokio::test]
async fn connections_are_reused_across_sessions() {
    let h = harness(CompressionMethod::None).await;

    let mut sink = h.remote.upload().await.unwrap();
    sink.push(Record::new(1, set([1]), 10)).await.unwrap();
    sink.finish().await.unwrap();
    assert_eq!(h.pool.idle_count(), 1);
    assert_eq!(h.pool.in_use_count(), 0);

    let _ = download_all(&h.remote).await;
    // The download reused the parked connection and parked it again.
    assert_eq!(h.pool.idle_count(), 1);
    assert_eq!(h.pool.in_use_count(), 0);
}

#[tokio::test]
async fn remote_remove_installs_tombstones() {
    let h = harness(CompressionMethod::None).await;

    let mut sink = h.remote.upload().await.unwrap();
    sink.push(Record::new(1, set([1]), 10)).await.unwrap();
    sink.push(Record::new(2, set([2]), 11)).await.unwrap();
    sink.finish().await.unwrap();

    let mut remover = h.remote.remove().await.unwrap();
    remover.push(Tombstone::new(1, 20)).await.unwrap();
    remover.finish().await.unwrap();

    let records = download_all(&h.remote).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, 2);
}

#[tokio::test]
async fn cancelled_upload_installs_nothing() {
    let h = harness(CompressionMethod::None).await;

    {
        let mut sink = h.remote.upload().await.unwrap();
        sink.push(Record::new(1, set([1]), 10)).await.unwrap();
        // dropped without finish: the connection closes and the server
        // sees a stream torn before its terminator
    }

    // Give the server a moment to observe the torn stream.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(download_all(&h.store).await.is_empty());
    assert_eq!(h.pool.idle_count(), 0, "torn connection must not be pooled");
}

#[tokio::test]
async fn download_with_cutoff_travels_on_the_wire() {
    use conflux_core::{Lww, LwwCrdt};
    type LwwC = LwwCrdt<i64, i64>;

    let store: MemoryStore<LwwC> = MemoryStore::new(LwwCrdt::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = StorageServer::new(
        Arc::new(store.clone()) as Arc<dyn CrdtStore<LwwC>>,
        BincodeCodec,
        NetConfig::default(),
    );
    tokio::spawn(server.serve(listener, shutdown_rx));

    let mut sink = store.upload().await.unwrap();
    sink.push(Record::new(1, Lww::new(10, 10), 10)).await.unwrap();
    sink.push(Record::new(2, Lww::new(20, 50), 50)).await.unwrap();
    sink.finish().await.unwrap();

    let pool = ConnectionPool::new(NetConfig::default());
    let remote: RemoteStore<LwwC, _> = RemoteStore::new(
        addr,
        pool,
        BincodeCodec,
        NetConfig::default(),
        CompressionMethod::None,
    );

    let mut source = remote.download(Some(30)).await.unwrap();
    let first = source.next().await.unwrap().unwrap();
    assert_eq!(first.key, 2);
    assert!(source.next().await.unwrap().is_none());
}

#[tokio::test]
async fn remote_size_is_not_supported() {
    let h = harness(CompressionMethod::None).await;
    let err = h.remote.size().await.unwrap_err();
    assert!(matches!(err, conflux_core::Error::Conflict { .. }));
}
