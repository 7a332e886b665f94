use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::metrics_consts::{
    OFFSET_STORE_WRITES, PARTITIONS_RESTORED, PARTITIONS_REVOKED, SEEK_FALLBACKS,
};
use crate::offset_store::OffsetStore;
use crate::types::Partition;

/// What the broker client lets the listener do from inside a rebalance callback.
///
/// Both operations run synchronously on the thread that is polling, so they must
/// not be handed off to another task.
pub trait PartitionControl {
    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError>;

    fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError>;
}

/// Reacts to partition revocation and assignment.
///
/// # Revoke
///
/// ```text
/// on_partitions_revoked
///     ├─► commit tracked offsets for the revoked partitions   [skipped with auto-commit]
///     ├─► persist them to the offset store                    [skipped with auto-commit]
///     └─► forget tracking + ownership for those partitions
/// ```
///
/// # Assign
///
/// ```text
/// on_partitions_assigned
///     ├─► ownership := assigned set (replaces, never merges)
///     └─► for each partition:
///             stored offset?  ──yes──► seek ──failed──► broker default + warn
///                    └──no──► broker default (auto.offset.reset)
/// ```
pub struct RebalanceListener {
    store: Arc<dyn OffsetStore>,
    tracker: Arc<OffsetTracker>,
    auto_commit: bool,
    owned: RwLock<HashSet<Partition>>,
}

impl RebalanceListener {
    pub fn new(store: Arc<dyn OffsetStore>, tracker: Arc<OffsetTracker>, auto_commit: bool) -> Self {
        Self {
            store,
            tracker,
            auto_commit,
            owned: RwLock::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn OffsetStore> {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn on_partitions_revoked(&self, control: &dyn PartitionControl, partitions: &[Partition]) {
        if partitions.is_empty() {
            debug!("Skipping empty revoke");
            return;
        }

        info!(count = partitions.len(), "Revoking partitions");

        if !self.auto_commit {
            let offsets = self.tracker.snapshot_for(partitions);
            if !offsets.is_empty() {
                if let Err(e) = control.commit_sync(&offsets) {
                    warn!(
                        partitions = offsets.len(),
                        "Failed to commit offsets of revoked partitions: {e:#}"
                    );
                }
                match self.store.put_all(&offsets) {
                    Ok(()) => {
                        metrics::counter!(OFFSET_STORE_WRITES, "outcome" => "success")
                            .increment(1);
                    }
                    Err(e) => {
                        error!(error = ?e, "Failed to persist offsets of revoked partitions");
                        metrics::counter!(OFFSET_STORE_WRITES, "outcome" => "failure")
                            .increment(1);
                    }
                }
            }
        }

        let mut owned = self.owned.write();
        for partition in partitions {
            self.tracker.clear_partition(partition);
            owned.remove(partition);
        }
        metrics::counter!(PARTITIONS_REVOKED).increment(partitions.len() as u64);
    }

    pub fn on_partitions_assigned(&self, control: &dyn PartitionControl, partitions: &[Partition]) {
        *self.owned.write() = partitions.iter().cloned().collect();

        info!(count = partitions.len(), "Partitions assigned");

        for partition in partitions {
            let stored = match self.store.get(partition) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        error = ?e,
                        "Failed to read stored offset, using broker default position"
                    );
                    None
                }
            };

            let Some(offset) = stored else {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "No stored offset, using broker default position"
                );
                continue;
            };

            match control.seek(partition, offset) {
                Ok(()) => {
                    info!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset,
                        "Restored partition position from offset store"
                    );
                    metrics::counter!(PARTITIONS_RESTORED).increment(1);
                }
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset,
                        "Seek failed, falling back to broker default position: {e:#}"
                    );
                    metrics::counter!(SEEK_FALLBACKS).increment(1);
                }
            }
        }
    }

    pub fn owns(&self, partition: &Partition) -> bool {
        self.owned.read().contains(partition)
    }

    pub fn has_assignment(&self) -> bool {
        !self.owned.read().is_empty()
    }

    pub fn owned_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.owned.read().iter().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Forget the current assignment. Used once a subscription has been fully
    /// drained, before a new one is opened.
    pub fn reset_ownership(&self) {
        self.owned.write().clear();
    }
}
