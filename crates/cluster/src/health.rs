//! Per-partition health: HEALTHY → DEAD on failure, DEAD → HEALTHY after
//! a cooldown plus one successful probe.

use crate::scheme::PartitionId;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
enum PeerState {
    Healthy,
    Dead { since: Instant },
}

/// Tracks which partitions are currently usable.
///
/// A DEAD partition is skipped by writes and reads until its cooldown
/// elapses; the first operation afterwards acts as the probe. The caller
/// reports the probe's outcome through [`mark_healthy`] or [`mark_dead`].
///
/// [`mark_healthy`]: HealthTracker::mark_healthy
/// [`mark_dead`]: HealthTracker::mark_dead
pub struct HealthTracker<P> {
    peers: DashMap<P, PeerState>,
    cooldown: Duration,
}

impl<P: PartitionId> HealthTracker<P> {
    /// Tracker with the given probe cooldown.
    pub fn new(cooldown: Duration) -> Self {
        HealthTracker {
            peers: DashMap::new(),
            cooldown,
        }
    }

    /// True when the partition may be used: HEALTHY, unknown, or DEAD
    /// with its cooldown elapsed (the probe case).
    pub fn is_available(&self, partition: &P) -> bool {
        match self.peers.get(partition).map(|state| *state) {
            Some(PeerState::Dead { since }) => since.elapsed() >= self.cooldown,
            _ => true,
        }
    }

    /// Record a transport or ack failure. Re-arms the cooldown if the
    /// partition was already dead.
    pub fn mark_dead(&self, partition: &P) {
        let previous = self.peers.insert(
            partition.clone(),
            PeerState::Dead {
                since: Instant::now(),
            },
        );
        if !matches!(previous, Some(PeerState::Dead { .. })) {
            warn!(partition = ?partition, "partition marked dead");
        }
    }

    /// Record a successful operation (including a probe).
    pub fn mark_healthy(&self, partition: &P) {
        let previous = self.peers.insert(partition.clone(), PeerState::Healthy);
        if matches!(previous, Some(PeerState::Dead { .. })) {
            debug!(partition = ?partition, "partition back to healthy");
        }
    }

    /// Partitions currently dead (cooldown elapsed or not).
    pub fn dead_partitions(&self) -> Vec<P> {
        self.peers
            .iter()
            .filter(|entry| matches!(entry.value(), PeerState::Dead { .. }))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_partitions_are_available() {
        let tracker: HealthTracker<String> = HealthTracker::new(Duration::from_secs(10));
        assert!(tracker.is_available(&"p".to_string()));
    }

    #[test]
    fn dead_partition_waits_out_cooldown() {
        let tracker: HealthTracker<String> = HealthTracker::new(Duration::from_secs(3600));
        let p = "p".to_string();
        tracker.mark_dead(&p);
        assert!(!tracker.is_available(&p));
        assert_eq!(tracker.dead_partitions(), vec![p.clone()]);

        tracker.mark_healthy(&p);
        assert!(tracker.is_available(&p));
        assert!(tracker.dead_partitions().is_empty());
    }

    #[test]
    fn elapsed_cooldown_allows_probe() {
        let tracker: HealthTracker<String> = HealthTracker::new(Duration::from_millis(0));
        let p = "p".to_string();
        tracker.mark_dead(&p);
        // Zero cooldown: immediately probeable, but still recorded dead.
        assert!(tracker.is_available(&p));
        assert_eq!(tracker.dead_partitions(), vec![p]);
    }
}
