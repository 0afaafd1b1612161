//! Rendezvous hashing: deterministic partition ranking per key.

use crate::scheme::PartitionId;
use conflux_core::{RecordCodec, Result};
use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

/// Ranks every key against every partition by
/// `xxh3(key-bytes ++ partition-bytes)` and selects the top R, breaking
/// score ties by partition natural order.
///
/// Recomputing with the same partition set yields the same ranking, and
/// adding or removing one partition reassigns only the keys that ranked
/// it in their top R, a `replication / |partitions|` fraction in
/// expectation.
pub struct RendezvousSharder<P> {
    /// Partitions with their encoded bytes, sorted by natural order.
    entries: Vec<(P, Vec<u8>)>,
    replication: usize,
}

impl<P: PartitionId> RendezvousSharder<P> {
    /// Build a sharder over a partition set.
    pub fn new<C: RecordCodec>(
        partitions: impl IntoIterator<Item = P>,
        replication: usize,
        codec: &C,
    ) -> Result<Self> {
        let mut entries = Vec::new();
        for partition in partitions {
            let bytes = codec.encode(&partition)?;
            entries.push((partition, bytes));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(RendezvousSharder {
            entries,
            replication,
        })
    }

    /// The replication factor R.
    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no partition is known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The top-R partitions for a key, highest score first. The order is
    /// deterministic, so re-replication after a topology change walks
    /// replicas in a stable sequence.
    pub fn top(&self, key_bytes: &[u8]) -> SmallVec<[P; 4]> {
        let mut scored: Vec<(u64, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, (_, partition_bytes))| {
                let mut hasher = Xxh3::new();
                hasher.update(key_bytes);
                hasher.update(partition_bytes);
                (hasher.digest(), index)
            })
            .collect();
        // Highest score wins; entries are pre-sorted so equal scores fall
        // back to partition natural order.
        scored.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(self.replication)
            .map(|(_, index)| self.entries[index].0.clone())
            .collect()
    }
}
