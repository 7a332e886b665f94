//! Offset Tracker - the poll loop's in-memory offset map
//!
//! Holds, per partition, the next offset to read (highest dispatched offset + 1).
//! Commits and checkpoints always take a full snapshot of this map, so a commit
//! that failed is subsumed by the next one.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::types::Partition;

#[derive(Debug, Default)]
pub struct OffsetTracker {
    processed: DashMap<Partition, i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that everything before `next_offset` has been handled.
    ///
    /// Offsets only move forward. A lower offset is ignored and logged, it would
    /// mean the broker redelivered something we already applied.
    pub fn mark_processed(&self, partition: &Partition, next_offset: i64) {
        self.processed
            .entry(partition.clone())
            .and_modify(|current| {
                if next_offset > *current {
                    *current = next_offset;
                } else if next_offset < *current {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        current = *current,
                        rejected = next_offset,
                        "Ignoring offset regression"
                    );
                }
            })
            .or_insert_with(|| {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = next_offset,
                    "Initializing partition offset"
                );
                next_offset
            });
    }

    /// Snapshot of all tracked offsets, ready to commit or persist.
    pub fn snapshot(&self) -> HashMap<Partition, i64> {
        self.processed
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Snapshot restricted to the given partitions.
    pub fn snapshot_for(&self, partitions: &[Partition]) -> HashMap<Partition, i64> {
        partitions
            .iter()
            .filter_map(|p| self.get_partition_offset(p).map(|offset| (p.clone(), offset)))
            .collect()
    }

    pub fn get_partition_offset(&self, partition: &Partition) -> Option<i64> {
        self.processed.get(partition).map(|r| *r.value())
    }

    /// Drop tracking for a partition once its offsets have been flushed.
    pub fn clear_partition(&self, partition: &Partition) {
        if self.processed.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset tracking for revoked partition"
            );
        }
    }

    pub fn clear_all(&self) {
        self.processed.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}
