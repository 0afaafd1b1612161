//! Anti-entropy convergence and the rebalancing pass.

use conflux_cluster::{ClusterStore, Endpoint, PartitionScheme, RepairLoop};
use conflux_core::{
    BincodeCodec, ClusterConfig, CrdtStore, Error, GSet, GSetCrdt, QuorumPolicy, Record,
    RecordSink, RecordSource, RepairConfig, Result,
};
use conflux_store::MemoryStore;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

type Crdt = GSetCrdt<i64, i64>;
type Cluster = ClusterStore<Crdt, String, BincodeCodec>;

fn set(elems: impl IntoIterator<Item = i64>) -> GSet<i64> {
    GSet::of(elems)
}

fn endpoint(port: u16) -> Endpoint {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    Endpoint::Remote(addr)
}

fn cluster_over(
    stores: &[(&str, u16, MemoryStore<Crdt>)],
    replication: usize,
) -> (Cluster, PartitionScheme<String>) {
    let mut current = BTreeMap::new();
    let mut by_endpoint: HashMap<Endpoint, Arc<dyn CrdtStore<Crdt>>> = HashMap::new();
    for (name, port, store) in stores {
        current.insert(name.to_string(), endpoint(*port));
        by_endpoint.insert(
            endpoint(*port),
            Arc::new(store.clone()) as Arc<dyn CrdtStore<Crdt>>,
        );
    }
    let factory = move |e: &Endpoint| {
        by_endpoint
            .get(e)
            .cloned()
            .ok_or_else(|| Error::transient("unknown endpoint"))
    };
    let cluster = ClusterStore::new(
        GSetCrdt::new(),
        BincodeCodec,
        ClusterConfig {
            replication_factor: replication,
            quorum: QuorumPolicy::Strict,
            ..ClusterConfig::default()
        },
        factory,
    );
    let scheme = PartitionScheme::new(current);
    cluster.install_scheme(scheme.clone()).unwrap();
    (cluster, scheme)
}

async fn upload(store: &MemoryStore<Crdt>, records: Vec<Record<i64, GSet<i64>>>) {
    let mut sink = store.upload().await.unwrap();
    for record in records {
        sink.push(record).await.unwrap();
    }
    sink.finish().await.unwrap();
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
async fn one_cycle_each_direction_converges_two_nodes() -> Result<()> {
    let store_a = MemoryStore::new(GSetCrdt::new());
    let store_b = MemoryStore::new(GSetCrdt::new());
    upload(&store_a, vec![Record::new(1, set([1, 2]), 10)]).await;
    upload(&store_b, vec![Record::new(1, set([2, 3]), 11)]).await;

    let (cluster_a, _) = cluster_over(
        &[("a", 7200, store_a.clone()), ("b", 7201, store_b.clone())],
        2,
    );
    let (cluster_b, _) = cluster_over(
        &[("a", 7200, store_a.clone()), ("b", 7201, store_b.clone())],
        2,
    );

    let repair_a = RepairLoop::new(
        cluster_a,
        Arc::new(store_a.clone()),
        Some("a".to_string()),
        RepairConfig::default(),
    );
    let repair_b = RepairLoop::new(
        cluster_b,
        Arc::new(store_b.clone()),
        Some("b".to_string()),
        RepairConfig::default(),
    );

    repair_a.cycle().await?;
    repair_b.cycle().await?;

    let expected = set([1, 2, 3]);
    let records_a = download_all(&store_a).await;
    let records_b = download_all(&store_b).await;
    assert_eq!(records_a.len(), 1);
    assert_eq!(records_a[0].state, expected);
    assert_eq!(records_b[0].state, expected);

    // Further cycles are no-ops: state is already converged.
    repair_a.cycle().await?;
    repair_b.cycle().await?;
    assert_eq!(download_all(&store_a).await, records_a);
    assert_eq!(download_all(&store_b).await, records_b);
    Ok(())
}

#[tokio::test]
async fn rebalance_copies_retiring_partitions_and_promotes_target() -> Result<()> {
    let store_a = MemoryStore::new(GSetCrdt::new());
    let store_b = MemoryStore::new(GSetCrdt::new());
    let store_c = MemoryStore::new(GSetCrdt::new());

    // Partition b holds the data and is about to be retired.
    upload(
        &store_b,
        vec![
            Record::new(1, set([10]), 10),
            Record::new(2, set([20]), 11),
            Record::new(3, set([30]), 12),
        ],
    )
    .await;

    let mut current = BTreeMap::new();
    current.insert("a".to_string(), endpoint(7300));
    current.insert("b".to_string(), endpoint(7301));
    let mut target = BTreeMap::new();
    target.insert("a".to_string(), endpoint(7300));
    target.insert("c".to_string(), endpoint(7302));

    let mut by_endpoint: HashMap<Endpoint, Arc<dyn CrdtStore<Crdt>>> = HashMap::new();
    by_endpoint.insert(endpoint(7300), Arc::new(store_a.clone()));
    by_endpoint.insert(endpoint(7301), Arc::new(store_b.clone()));
    by_endpoint.insert(endpoint(7302), Arc::new(store_c.clone()));
    let factory = move |e: &Endpoint| {
        by_endpoint
            .get(e)
            .cloned()
            .ok_or_else(|| Error::transient("unknown endpoint"))
    };

    let cluster: Cluster = ClusterStore::new(
        GSetCrdt::new(),
        BincodeCodec,
        ClusterConfig {
            replication_factor: 1,
            quorum: QuorumPolicy::Strict,
            ..ClusterConfig::default()
        },
        factory,
    );
    let scheme = PartitionScheme {
        current,
        target: Some(target),
    };
    cluster.install_scheme(scheme).unwrap();

    let repair = RepairLoop::new(
        cluster.clone(),
        Arc::new(store_a.clone()),
        Some("a".to_string()),
        RepairConfig::default(),
    );
    repair.cycle().await?;

    // Target promoted: the scheme now reads from {a, c} only.
    let promoted = cluster.scheme().unwrap();
    assert!(!promoted.rebalancing());
    assert_eq!(
        promoted.current.keys().cloned().collect::<Vec<_>>(),
        vec!["a".to_string(), "c".to_string()]
    );

    // Every key that lived on the retiring partition is now readable
    // through the promoted layout.
    let records = download_all(&cluster).await;
    let keys: Vec<i64> = records.iter().map(|r| r.key).collect();
    assert_eq!(keys, vec![1, 2, 3]);
    Ok(())
}
