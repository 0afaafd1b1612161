//! One storage node: WAL in front of the local store, cluster storage
//! over the partition scheme, and the background tasks that keep both
//! honest.

use conflux_cluster::{
    ClusterStore, ConnectionPool, Discovery, PartitionId, RepairLoop, StoreFactory,
};
use conflux_core::{
    ClusterConfig, CrdtFunction, CrdtStore, Error, RecordCodec, RepairConfig, Result, WalConfig,
};
use conflux_wal::{RecoverySummary, WriteAheadLog};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Clean stop.
pub const EXIT_OK: i32 = 0;
/// Unrecoverable storage corruption; operator action required.
pub const EXIT_CORRUPTION: i32 = 2;
/// The node never came up because its configuration is unusable.
pub const EXIT_CONFIG: i32 = 3;

/// Map an error to a host process exit code. `startup` distinguishes
/// failures before the node ever served (configuration) from fatal
/// failures at runtime (corruption).
pub fn exit_code(error: &Error, startup: bool) -> i32 {
    if !error.is_fatal() {
        return EXIT_OK;
    }
    if startup {
        EXIT_CONFIG
    } else {
        EXIT_CORRUPTION
    }
}

/// Per-node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name embedded in WAL segment files.
    pub node_id: String,
    /// Directory holding WAL segments.
    pub wal_dir: PathBuf,
    /// Write-ahead log behavior.
    pub wal: WalConfig,
    /// Replication and quorum.
    pub cluster: ClusterConfig,
    /// Anti-entropy cadence.
    pub repair: RepairConfig,
}

impl NodeConfig {
    /// Defaults for everything except identity and the WAL location.
    pub fn new(node_id: impl Into<String>, wal_dir: impl Into<PathBuf>) -> Self {
        NodeConfig {
            node_id: node_id.into(),
            wal_dir: wal_dir.into(),
            wal: WalConfig::default(),
            cluster: ClusterConfig::default(),
            repair: RepairConfig::default(),
        }
    }
}

/// A running storage node.
///
/// `start()` replays the WAL, installs the first partition scheme, and
/// spawns the discovery watch, repair, and WAL-rotation tasks. `stop()`
/// tears everything down in order: background tasks first, then a final
/// WAL flush, then the connection pool; operations issued afterwards
/// fail with `Shutdown`.
pub struct Node<F: CrdtFunction, P: PartitionId, C: RecordCodec> {
    config: NodeConfig,
    wal: Arc<WriteAheadLog<F, C>>,
    local: Arc<dyn CrdtStore<F>>,
    cluster: ClusterStore<F, P, C>,
    repair: Arc<RepairLoop<F, P, C>>,
    discovery: Arc<dyn Discovery<P>>,
    pool: Option<Arc<ConnectionPool>>,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> Node<F, P, C> {
    /// Assemble a node. `factory` opens stores for the endpoints named
    /// by partition schemes; `pool`, when given, is closed on `stop()`
    /// (pass the pool your factory builds remote stores from).
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: NodeConfig,
        crdt: F,
        codec: C,
        local: Arc<dyn CrdtStore<F>>,
        discovery: Arc<dyn Discovery<P>>,
        factory: impl StoreFactory<F> + 'static,
        self_partition: Option<P>,
        pool: Option<Arc<ConnectionPool>>,
    ) -> Result<Self> {
        let wal = Arc::new(
            WriteAheadLog::open(
                config.wal_dir.clone(),
                config.node_id.clone(),
                config.wal.clone(),
                codec.clone(),
                Arc::clone(&local),
            )
            .await?,
        );
        let cluster = ClusterStore::new(crdt, codec, config.cluster.clone(), factory);
        let repair = Arc::new(RepairLoop::new(
            cluster.clone(),
            Arc::clone(&local),
            self_partition,
            config.repair.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Ok(Node {
            config,
            wal,
            local,
            cluster,
            repair,
            discovery,
            pool,
            shutdown,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Recover the WAL, install the first partition scheme, and spawn
    /// the background tasks.
    pub async fn start(&self) -> Result<RecoverySummary> {
        let summary = self.wal.start().await?;

        let (scheme, revision) = self.discovery.watch(None).await?;
        self.cluster.install_scheme(scheme)?;
        info!(
            node = %self.config.node_id,
            revision,
            recovered_segments = summary.segments,
            recovered_records = summary.records,
            "node started"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn({
            let cluster = self.cluster.clone();
            let discovery = Arc::clone(&self.discovery);
            let shutdown = self.shutdown.subscribe();
            async move { cluster.run_discovery(discovery, shutdown).await }
        }));
        tasks.push(tokio::spawn({
            let repair = Arc::clone(&self.repair);
            let shutdown = self.shutdown.subscribe();
            async move { repair.run(shutdown).await }
        }));
        tasks.push(tokio::spawn({
            let wal = Arc::clone(&self.wal);
            let interval = self.config.wal.rotation_interval();
            let mut shutdown = self.shutdown.subscribe();
            async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = wal.flush_if_dirty().await {
                                warn!(error = %e, "interval rotation failed");
                            }
                        }
                    }
                }
            }
        }));
        Ok(summary)
    }

    /// Durably record one upsert. Resolves once the record is appended
    /// to the open WAL segment.
    pub async fn put(&self, key: F::Key, state: F::State) -> Result<()> {
        self.wal.put(key, state).await
    }

    /// Seal and drain the WAL; resolves when local storage has
    /// acknowledged every record written so far.
    pub async fn flush(&self) -> Result<()> {
        self.wal.flush().await
    }

    /// The cluster-wide store surface.
    pub fn cluster(&self) -> &ClusterStore<F, P, C> {
        &self.cluster
    }

    /// This node's local store.
    pub fn local(&self) -> &Arc<dyn CrdtStore<F>> {
        &self.local
    }

    /// Step the repair loop once, outside its timer. Exposed for hosts
    /// that want repair-on-demand.
    pub async fn repair_now(&self) -> Result<()> {
        self.repair.cycle().await
    }

    /// A shutdown signal for auxiliary tasks (e.g. a storage server
    /// accept loop) that should stop with this node.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ordered teardown. Safe to call more than once.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let result = self.wal.stop().await;
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        info!(node = %self.config.node_id, "node stopped");
        result
    }
}
