//! Background anti-entropy between replicas.
//!
//! Each cycle pulls recent changes from one randomly chosen healthy peer
//! and merges them into the local store. Merge idempotence and
//! commutativity make the order of cycles irrelevant; a cycle that races
//! a concurrent write just converges one cycle later. While the scheme
//! carries a `target`, each cycle additionally copies every retiring
//! partition into the target layout and promotes the target once a full
//! pass has been acknowledged.

use crate::cluster::ClusterStore;
use crate::scheme::{PartitionId, PartitionScheme};
use crate::sharder::RendezvousSharder;
use conflux_core::{
    pipe, BoxRecordSink, Clock, CrdtFunction, CrdtStore, RecordCodec, RecordSink, RecordSource,
    RepairConfig, Result, Timestamp,
};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The repair task. Drive it with [`run`] or step it manually with
/// [`cycle`] (tests do the latter).
///
/// [`run`]: RepairLoop::run
/// [`cycle`]: RepairLoop::cycle
pub struct RepairLoop<F: CrdtFunction, P: PartitionId, C: RecordCodec> {
    cluster: ClusterStore<F, P, C>,
    local: Arc<dyn CrdtStore<F>>,
    self_partition: Option<P>,
    config: RepairConfig,
    clock: Clock,
    last_repair: AtomicU64,
}

impl<F: CrdtFunction, P: PartitionId, C: RecordCodec> RepairLoop<F, P, C> {
    /// A repair loop pulling into `local`, skipping `self_partition` when
    /// choosing peers.
    pub fn new(
        cluster: ClusterStore<F, P, C>,
        local: Arc<dyn CrdtStore<F>>,
        self_partition: Option<P>,
        config: RepairConfig,
    ) -> Self {
        RepairLoop {
            cluster,
            local,
            self_partition,
            config,
            clock: Clock::new(),
            last_repair: AtomicU64::new(0),
        }
    }

    /// Run until shutdown, one cycle per configured interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; the
        // configured value is a minimum delay between cycles.
        interval.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.cycle().await {
                        warn!(error = %e, "repair cycle failed");
                    }
                }
            }
        }
    }

    /// One anti-entropy cycle: pull-merge from a random healthy peer,
    /// then advance the repair cutoff; run the rebalancing pass when a
    /// target layout is set.
    pub async fn cycle(&self) -> Result<()> {
        let cutoff = self.last_repair.load(Ordering::SeqCst);
        let started = self.clock.now();

        let peers: Vec<P> = self
            .cluster
            .read_partitions()
            .into_iter()
            .filter(|p| Some(p) != self.self_partition.as_ref())
            .filter(|p| self.cluster.health().is_available(p))
            .collect();

        let chosen_peer = peers.choose(&mut rand::thread_rng()).cloned();
        if let Some(peer) = chosen_peer {
            match self.pull_from(&peer, cutoff).await {
                Ok(records) => {
                    self.cluster.health().mark_healthy(&peer);
                    debug!(peer = ?peer, records, "anti-entropy pull complete");
                    self.last_repair.store(started, Ordering::SeqCst);
                }
                Err(e) => {
                    self.cluster.health().mark_dead(&peer);
                    return Err(e);
                }
            }
        }

        if let Some(scheme) = self.cluster.scheme() {
            if scheme.rebalancing() {
                self.rebalance(&scheme).await?;
                self.cluster.promote_target()?;
                info!("rebalance pass acknowledged, target promoted");
            }
        }
        Ok(())
    }

    async fn pull_from(&self, peer: &P, cutoff: Timestamp) -> Result<u64> {
        let source = self.cluster.store_for(peer)?.download(Some(cutoff)).await?;
        let sink = self.local.upload().await?;
        pipe::<F>(source, sink).await
    }

    /// Copy every retiring partition into the target layout. A retiring
    /// partition counts as copied only when every target session it fed
    /// has acknowledged end-of-stream; one full acked pass streams every
    /// live key, which is the completion witness.
    async fn rebalance(&self, scheme: &PartitionScheme<P>) -> Result<()> {
        let Some(target) = &scheme.target else {
            return Ok(());
        };
        let sharder = RendezvousSharder::new(
            target.keys().cloned(),
            self.cluster.config().replication_factor,
            self.cluster.codec(),
        )?;

        for retiring in scheme.retiring() {
            let mut source = self.cluster.store_for(&retiring)?.download(None).await?;
            let mut sinks: HashMap<P, BoxRecordSink<F>> = HashMap::new();
            let mut moved = 0u64;
            while let Some(record) = source.next().await? {
                let key_bytes = self.cluster.codec().encode(&record.key)?;
                for partition in sharder.top(&key_bytes) {
                    if !sinks.contains_key(&partition) {
                        let sink = self.cluster.store_for(&partition)?.upload().await?;
                        sinks.insert(partition.clone(), sink);
                    }
                    if let Some(sink) = sinks.get_mut(&partition) {
                        sink.push(record.clone()).await?;
                    }
                }
                moved += 1;
            }
            for (_, sink) in sinks {
                sink.finish().await?;
            }
            debug!(partition = ?retiring, records = moved, "retiring partition copied");
        }
        Ok(())
    }
}
