//! The cluster-wide store: every session fans out over rendezvous-chosen
//! replicas, with quorum accounting and dead-partition skipping.

use crate::discovery::Discovery;
use crate::health::HealthTracker;
use crate::scheme::{Endpoint, PartitionId, PartitionScheme};
use crate::sharder::RendezvousSharder;
use async_trait::async_trait;
use conflux_core::{
    BoxRecordSink, BoxRecordSource, BoxTombstoneSink, ClusterConfig, CrdtFunction, CrdtStore,
    Error, PartitionFailure, Record, RecordCodec, RecordSink, RecordSource, Result, Timestamp,
    Tombstone, TombstoneSink,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Opens a store for an endpoint named by the partition scheme. The
/// launcher supplies one; tests use a closure.
pub trait StoreFactory<F: CrdtFunction>: Send + Sync {
    /// Open (or reuse) the store behind an endpoint.
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn CrdtStore<F>>>;
}

impl<F, T> StoreFactory<F> for T
where
    F: CrdtFunction,
    T: Fn(&Endpoint) -> Result<Arc<dyn CrdtStore<F>>> + Send + Sync,
{
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn CrdtStore<F>>> {
        self(endpoint)
    }
}

struct Topology<F: CrdtFunction, P: PartitionId> {
    scheme: PartitionScheme<P>,
    stores: HashMap<P, Arc<dyn CrdtStore<F>>>,
    write_sharder: Arc<RendezvousSharder<P>>,
    read_partitions: Vec<P>,
}

/// What a session captures at open: sessions stay on the topology they
/// started with even if discovery replaces the scheme mid-stream.
struct Snapshot<F: CrdtFunction, P: PartitionId> {
    stores: HashMap<P, Arc<dyn CrdtStore<F>>>,
    write_sharder: Arc<RendezvousSharder<P>>,
    read_partitions: Vec<P>,
}

struct Inner<F: CrdtFunction, P: PartitionId, C: RecordCodec> {
    crdt: F,
    codec: C,
    config: ClusterConfig,
    factory: Box<dyn StoreFactory<F>>,
    health: HealthTracker<P>,
    topology: RwLock<Option<Topology<F, P>>>,
}

/// A [`CrdtStore`] spanning the whole cluster.
///
/// Uploads tee each record to the top-R partitions of the write sharder;
/// downloads open one session per current partition and merge them into
/// a single key-ordered stream. A session tolerates up to R − W failed
/// partitions, where W comes from the configured quorum policy; beyond
/// that it fails with `Exhausted`, listing every failed partition.
pub struct ClusterStore<F: CrdtFunction, P: PartitionId, C: RecordCodec> {
    inner: Arc<Inner<F, P, C>>,
}

impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> Clone for ClusterStore<F, P, C> {
    fn clone(&self) -> Self {
        ClusterStore {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> ClusterStore<F, P, C> {
    /// A cluster store with no scheme installed yet. Sessions fail until
    /// [`install_scheme`] or the discovery loop delivers one.
    ///
    /// [`install_scheme`]: ClusterStore::install_scheme
    pub fn new<SF>(crdt: F, codec: C, config: ClusterConfig, factory: SF) -> Self
    where
        SF: StoreFactory<F> + 'static,
    {
        let cooldown = config.peer_cooldown();
        ClusterStore {
            inner: Arc::new(Inner {
                crdt,
                codec,
                config,
                factory: Box::new(factory),
                health: HealthTracker::new(cooldown),
                topology: RwLock::new(None),
            }),
        }
    }

    /// Atomically replace the partition scheme, rebuilding the sharder
    /// and opening stores for new endpoints. Stores whose endpoint is
    /// unchanged are reused.
    pub fn install_scheme(&self, scheme: PartitionScheme<P>) -> Result<()> {
        self.inner.config.validate(scheme.current.len())?;
        let write_set = scheme.write_set();
        let write_sharder = Arc::new(RendezvousSharder::new(
            write_set.keys().cloned(),
            self.inner.config.replication_factor,
            &self.inner.codec,
        )?);

        let mut topology = self.inner.topology.write();
        let previous_endpoints = topology.as_ref().map(|t| t.scheme.write_set());

        // A failed factory open leaves the previous topology in place.
        let mut stores = HashMap::new();
        for (partition, endpoint) in &write_set {
            let reused = match (topology.as_ref(), &previous_endpoints) {
                (Some(old), Some(old_endpoints))
                    if old_endpoints.get(partition) == Some(endpoint) =>
                {
                    old.stores.get(partition).cloned()
                }
                _ => None,
            };
            let store = match reused {
                Some(store) => store,
                None => self.inner.factory.open(endpoint)?,
            };
            stores.insert(partition.clone(), store);
        }

        let read_partitions = scheme.current.keys().cloned().collect();
        *topology = Some(Topology {
            scheme,
            stores,
            write_sharder,
            read_partitions,
        });
        Ok(())
    }

    /// The currently installed scheme, if any.
    pub fn scheme(&self) -> Option<PartitionScheme<P>> {
        self.inner
            .topology
            .read()
            .as_ref()
            .map(|t| t.scheme.clone())
    }

    /// Finish a rebalance: promote `target` to `current` and reinstall.
    pub fn promote_target(&self) -> Result<()> {
        let Some(mut scheme) = self.scheme() else {
            return Err(Error::conflict("no partition scheme installed"));
        };
        if !scheme.rebalancing() {
            return Ok(());
        }
        scheme.promote_target();
        self.install_scheme(scheme)
    }

    /// Direct handle to one partition's store. The repair loop pulls
    /// from peers this way.
    pub fn store_for(&self, partition: &P) -> Result<Arc<dyn CrdtStore<F>>> {
        self.inner
            .topology
            .read()
            .as_ref()
            .and_then(|t| t.stores.get(partition).cloned())
            .ok_or_else(|| Error::transient(format!("no store for partition {partition:?}")))
    }

    /// Partitions currently serving reads.
    pub fn read_partitions(&self) -> Vec<P> {
        self.inner
            .topology
            .read()
            .as_ref()
            .map(|t| t.read_partitions.clone())
            .unwrap_or_default()
    }

    /// The health tracker shared by every session.
    pub fn health(&self) -> &HealthTracker<P> {
        &self.inner.health
    }

    /// The codec keys and partitions are hashed with.
    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    /// The replication configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Drive a discovery service until shutdown: install every scheme it
    /// reports, feeding back the last observed one.
    pub async fn run_discovery(
        &self,
        discovery: Arc<dyn Discovery<P>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut prev = self.scheme();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                watched = discovery.watch(prev.as_ref()) => match watched {
                    Ok((scheme, revision)) => {
                        match self.install_scheme(scheme.clone()) {
                            Ok(()) => {
                                info!(
                                    revision,
                                    partitions = scheme.current.len(),
                                    rebalancing = scheme.rebalancing(),
                                    "partition scheme installed"
                                );
                                prev = Some(scheme);
                            }
                            Err(e) if e.is_fatal() => {
                                error!(error = %e, "rejecting partition scheme");
                                return;
                            }
                            Err(e) => warn!(error = %e, "failed to install partition scheme"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "discovery watch failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> Result<Snapshot<F, P>> {
        let topology = self.inner.topology.read();
        let Some(t) = topology.as_ref() else {
            return Err(Error::conflict("no partition scheme installed"));
        };
        Ok(Snapshot {
            stores: t.stores.clone(),
            write_sharder: Arc::clone(&t.write_sharder),
            read_partitions: t.read_partitions.clone(),
        })
    }

    fn quorum(&self) -> (usize, usize) {
        let replication = self.inner.config.replication_factor;
        let required = self.inner.config.quorum.required(replication);
        (required, replication - required)
    }
}

#[async_trait]
impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> CrdtStore<F> for ClusterStore<F, P, C> {
    async fn upload(&self) -> Result<BoxRecordSink<F>> {
        let snapshot = self.snapshot()?;
        let (required, tolerance) = self.quorum();
        Ok(Box::new(ClusterUploadSink {
            inner: Arc::clone(&self.inner),
            snapshot,
            sinks: HashMap::new(),
            failed: HashSet::new(),
            failures: Vec::new(),
            required,
            tolerance,
            poisoned: false,
        }))
    }

    async fn download(&self, cutoff: Option<Timestamp>) -> Result<BoxRecordSource<F>> {
        let snapshot = self.snapshot()?;
        let (required, tolerance) = self.quorum();
        let mut sources = Vec::new();
        let mut failures = Vec::new();
        for partition in &snapshot.read_partitions {
            if !self.inner.health.is_available(partition) {
                failures.push(PartitionFailure {
                    partition: format!("{partition:?}"),
                    cause: Box::new(Error::transient("partition marked dead")),
                });
                continue;
            }
            let Some(store) = snapshot.stores.get(partition) else {
                failures.push(PartitionFailure {
                    partition: format!("{partition:?}"),
                    cause: Box::new(Error::transient("no store for partition")),
                });
                continue;
            };
            match store.download(cutoff).await {
                Ok(source) => {
                    self.inner.health.mark_healthy(partition);
                    sources.push(PeekedSource {
                        partition: partition.clone(),
                        source,
                        head: None,
                    });
                }
                Err(e) => {
                    self.inner.health.mark_dead(partition);
                    failures.push(PartitionFailure {
                        partition: format!("{partition:?}"),
                        cause: Box::new(e),
                    });
                }
            }
        }
        if failures.len() > tolerance {
            return Err(Error::exhausted(required, sources.len(), failures));
        }
        Ok(Box::new(MergedSource {
            inner: Arc::clone(&self.inner),
            sources,
            failures,
            required,
            tolerance,
            primed: false,
        }))
    }

    async fn remove(&self) -> Result<BoxTombstoneSink<F>> {
        let snapshot = self.snapshot()?;
        let (required, tolerance) = self.quorum();
        Ok(Box::new(ClusterRemoveSink {
            inner: Arc::clone(&self.inner),
            snapshot,
            sinks: HashMap::new(),
            failed: HashSet::new(),
            failures: Vec::new(),
            required,
            tolerance,
            poisoned: false,
        }))
    }

    /// Approximate: the largest per-partition live-key count. Every key
    /// lives on R partitions, so no partition exceeds the keyspace.
    async fn size(&self) -> Result<u64> {
        let snapshot = self.snapshot()?;
        let mut best = 0u64;
        for partition in &snapshot.read_partitions {
            let Some(store) = snapshot.stores.get(partition) else {
                continue;
            };
            match store.size().await {
                Ok(size) => best = best.max(size),
                Err(_) => continue,
            }
        }
        Ok(best)
    }
}

// ---------------------------------------------------------------------------
// upload
// ---------------------------------------------------------------------------

struct ClusterUploadSink<F: CrdtFunction, P: PartitionId, C: RecordCodec> {
    inner: Arc<Inner<F, P, C>>,
    snapshot: Snapshot<F, P>,
    sinks: HashMap<P, BoxRecordSink<F>>,
    failed: HashSet<P>,
    failures: Vec<PartitionFailure>,
    required: usize,
    tolerance: usize,
    poisoned: bool,
}

impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> ClusterUploadSink<F, P, C> {
    fn fail_partition(&mut self, partition: P, cause: Error) {
        if self.failed.insert(partition.clone()) {
            self.inner.health.mark_dead(&partition);
            self.failures.push(PartitionFailure {
                partition: format!("{partition:?}"),
                cause: Box::new(cause),
            });
        }
    }

    fn check_budget(&mut self, acked: usize) -> Result<()> {
        if self.failures.len() > self.tolerance {
            self.poisoned = true;
            return Err(Error::exhausted(
                self.required,
                acked,
                std::mem::take(&mut self.failures),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> RecordSink<F>
    for ClusterUploadSink<F, P, C>
{
    async fn push(&mut self, record: Record<F::Key, F::State>) -> Result<()> {
        if self.poisoned {
            return Err(Error::conflict("upload session already failed"));
        }
        let key_bytes = self.inner.codec.encode(&record.key)?;
        let replicas = self.snapshot.write_sharder.top(&key_bytes);
        for partition in replicas {
            if self.failed.contains(&partition) {
                continue;
            }
            if !self.inner.health.is_available(&partition) {
                self.fail_partition(partition, Error::transient("partition marked dead"));
                continue;
            }
            if !self.sinks.contains_key(&partition) {
                let Some(store) = self.snapshot.stores.get(&partition) else {
                    self.fail_partition(partition, Error::transient("no store for partition"));
                    continue;
                };
                match store.upload().await {
                    Ok(sink) => {
                        self.sinks.insert(partition.clone(), sink);
                    }
                    Err(e) => {
                        self.fail_partition(partition, e);
                        continue;
                    }
                }
            }
            if let Some(sink) = self.sinks.get_mut(&partition) {
                if let Err(e) = sink.push(record.clone()).await {
                    self.sinks.remove(&partition);
                    self.fail_partition(partition, e);
                }
            }
        }
        self.check_budget(0)
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if this.poisoned {
            return Err(Error::conflict("upload session already failed"));
        }
        let mut acked = 0usize;
        for (partition, sink) in std::mem::take(&mut this.sinks) {
            match sink.finish().await {
                Ok(()) => {
                    this.inner.health.mark_healthy(&partition);
                    acked += 1;
                }
                Err(e) => this.fail_partition(partition, e),
            }
        }
        this.check_budget(acked)
    }
}

// ---------------------------------------------------------------------------
// remove
// ---------------------------------------------------------------------------

struct ClusterRemoveSink<F: CrdtFunction, P: PartitionId, C: RecordCodec> {
    inner: Arc<Inner<F, P, C>>,
    snapshot: Snapshot<F, P>,
    sinks: HashMap<P, BoxTombstoneSink<F>>,
    failed: HashSet<P>,
    failures: Vec<PartitionFailure>,
    required: usize,
    tolerance: usize,
    poisoned: bool,
}

impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> ClusterRemoveSink<F, P, C> {
    fn fail_partition(&mut self, partition: P, cause: Error) {
        if self.failed.insert(partition.clone()) {
            self.inner.health.mark_dead(&partition);
            self.failures.push(PartitionFailure {
                partition: format!("{partition:?}"),
                cause: Box::new(cause),
            });
        }
    }

    fn check_budget(&mut self, acked: usize) -> Result<()> {
        if self.failures.len() > self.tolerance {
            self.poisoned = true;
            return Err(Error::exhausted(
                self.required,
                acked,
                std::mem::take(&mut self.failures),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> TombstoneSink<F>
    for ClusterRemoveSink<F, P, C>
{
    async fn push(&mut self, tombstone: Tombstone<F::Key>) -> Result<()> {
        if self.poisoned {
            return Err(Error::conflict("remove session already failed"));
        }
        let key_bytes = self.inner.codec.encode(&tombstone.key)?;
        let replicas = self.snapshot.write_sharder.top(&key_bytes);
        for partition in replicas {
            if self.failed.contains(&partition) {
                continue;
            }
            if !self.inner.health.is_available(&partition) {
                self.fail_partition(partition, Error::transient("partition marked dead"));
                continue;
            }
            if !self.sinks.contains_key(&partition) {
                let Some(store) = self.snapshot.stores.get(&partition) else {
                    self.fail_partition(partition, Error::transient("no store for partition"));
                    continue;
                };
                match store.remove().await {
                    Ok(sink) => {
                        self.sinks.insert(partition.clone(), sink);
                    }
                    Err(e) => {
                        self.fail_partition(partition, e);
                        continue;
                    }
                }
            }
            if let Some(sink) = self.sinks.get_mut(&partition) {
                if let Err(e) = sink.push(tombstone.clone()).await {
                    self.sinks.remove(&partition);
                    self.fail_partition(partition, e);
                }
            }
        }
        self.check_budget(0)
    }

    /// Removes are idempotent, so W acks out of R suffice even when the
    /// remaining partitions never saw the tombstone.
    async fn finish(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if this.poisoned {
            return Err(Error::conflict("remove session already failed"));
        }
        let mut acked = 0usize;
        for (partition, sink) in std::mem::take(&mut this.sinks) {
            match sink.finish().await {
                Ok(()) => {
                    this.inner.health.mark_healthy(&partition);
                    acked += 1;
                }
                Err(e) => this.fail_partition(partition, e),
            }
        }
        this.check_budget(acked)
    }
}

// ---------------------------------------------------------------------------
// download
// ---------------------------------------------------------------------------

struct PeekedSource<F: CrdtFunction, P: PartitionId> {
    partition: P,
    source: BoxRecordSource<F>,
    head: Option<Record<F::Key, F::State>>,
}

/// R-way key-ordered merge across per-partition download sessions,
/// applying the CRDT merge on key collisions.
struct MergedSource<F: CrdtFunction, P: PartitionId, C: RecordCodec> {
    inner: Arc<Inner<F, P, C>>,
    sources: Vec<PeekedSource<F, P>>,
    failures: Vec<PartitionFailure>,
    required: usize,
    tolerance: usize,
    primed: bool,
}

impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> MergedSource<F, P, C> {
    fn check_tolerance(&mut self) -> Result<()> {
        if self.failures.len() > self.tolerance {
            return Err(Error::exhausted(
                self.required,
                self.sources.len(),
                std::mem::take(&mut self.failures),
            ));
        }
        Ok(())
    }

    async fn prime(&mut self) -> Result<()> {
        if self.primed {
            return Ok(());
        }
        let mut broken = Vec::new();
        for (index, peeked) in self.sources.iter_mut().enumerate() {
            match peeked.source.next().await {
                Ok(head) => peeked.head = head,
                Err(e) => {
                    self.inner.health.mark_dead(&peeked.partition);
                    self.failures.push(PartitionFailure {
                        partition: format!("{:?}", peeked.partition),
                        cause: Box::new(e),
                    });
                    broken.push(index);
                }
            }
        }
        for index in broken.into_iter().rev() {
            self.sources.remove(index);
        }
        self.primed = true;
        self.check_tolerance()
    }
}

#[async_trait]
impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> RecordSource<F> for MergedSource<F, P, C> {
    async fn next(&mut self) -> Result<Option<Record<F::Key, F::State>>> {
        self.prime().await?;
        loop {
            let key = self
                .sources
                .iter()
                .filter_map(|peeked| peeked.head.as_ref().map(|record| record.key.clone()))
                .min();
            let Some(key) = key else {
                return Ok(None);
            };

            let mut merged: Option<Record<F::Key, F::State>> = None;
            let mut broken = Vec::new();
            for (index, peeked) in self.sources.iter_mut().enumerate() {
                let matches = matches!(&peeked.head, Some(record) if record.key == key);
                if !matches {
                    continue;
                }
                if let Some(record) = peeked.head.take() {
                    merged = Some(match merged.take() {
                        Some(acc) => Record::new(
                            key.clone(),
                            self.inner.crdt.merge(acc.state, record.state),
                            acc.timestamp.max(record.timestamp),
                        ),
                        None => record,
                    });
                }
                match peeked.source.next().await {
                    Ok(head) => peeked.head = head,
                    Err(e) => {
                        self.inner.health.mark_dead(&peeked.partition);
                        self.failures.push(PartitionFailure {
                            partition: format!("{:?}", peeked.partition),
                            cause: Box::new(e),
                        });
                        broken.push(index);
                    }
                }
            }
            for index in broken.into_iter().rev() {
                self.sources.remove(index);
            }
            self.check_tolerance()?;

            if let Some(record) = merged {
                return Ok(Some(record));
            }
        }
    }
}
