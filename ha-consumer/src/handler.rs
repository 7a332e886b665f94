//! Record handling.
//!
//! The poll loop only knows [`RecordHandler`]. What a record does to state is up to
//! the [`ProcessingEngine`] behind [`EngineRecordHandler`], which also decides when
//! a snapshot is due and hands it to a [`Snapshotter`] without waiting for it.
//!
//! A snapshot records the next offset of every partition it has seen, so restoring
//! it also moves the offset store back and the records after the cut are replayed.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::metrics_consts::SNAPSHOTS;
use crate::offset_store::OffsetStore;
use crate::snapshot::{EngineState, Snapshot, SnapshotPolicy, SnapshotTrigger, Snapshotter};
use crate::types::{LeadershipState, Partition, PartitionOffset, Record};

/// Applies one record. Called from the poll task, so it must return well within
/// the poll interval.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record, leadership: LeadershipState) -> Result<()>;
}

/// The stateful engine records are applied to.
pub trait ProcessingEngine: Send + Sync {
    fn apply(&self, record: &Record, leadership: LeadershipState) -> Result<()>;

    /// Export a consistent copy of the current state.
    fn export_state(&self) -> Result<EngineState>;

    fn restore(&self, state: EngineState) -> Result<()>;
}

#[derive(Debug)]
struct SnapshotProgress {
    records_since_last: u64,
    last_snapshot_at: Instant,
    last_leadership: Option<LeadershipState>,
    covered: BTreeMap<Partition, i64>,
}

impl SnapshotProgress {
    fn cover(&mut self, partition: &Partition, next_offset: i64) {
        let entry = self.covered.entry(partition.clone()).or_insert(next_offset);
        *entry = (*entry).max(next_offset);
    }

    fn covered_offsets(&self) -> Vec<PartitionOffset> {
        self.covered
            .iter()
            .map(|(partition, offset)| PartitionOffset::new(partition.clone(), *offset))
            .collect()
    }

    fn record_applied(
        &mut self,
        policy: &SnapshotPolicy,
        leadership: LeadershipState,
    ) -> Option<SnapshotTrigger> {
        self.records_since_last += 1;
        let leadership_changed = self
            .last_leadership
            .is_some_and(|previous| previous != leadership);
        self.last_leadership = Some(leadership);

        let trigger = policy.trigger(
            self.records_since_last,
            self.last_snapshot_at.elapsed(),
            leadership_changed,
        );
        if trigger.is_some() {
            self.records_since_last = 0;
            self.last_snapshot_at = Instant::now();
        }
        trigger
    }
}

/// [`RecordHandler`] that feeds a [`ProcessingEngine`] and snapshots it per policy.
pub struct EngineRecordHandler {
    engine: Arc<dyn ProcessingEngine>,
    snapshotter: Arc<dyn Snapshotter>,
    policy: SnapshotPolicy,
    progress: Mutex<SnapshotProgress>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineRecordHandler {
    pub fn new(
        engine: Arc<dyn ProcessingEngine>,
        snapshotter: Arc<dyn Snapshotter>,
        policy: SnapshotPolicy,
    ) -> Self {
        Self {
            engine,
            snapshotter,
            policy,
            progress: Mutex::new(SnapshotProgress {
                records_since_last: 0,
                last_snapshot_at: Instant::now(),
                last_leadership: None,
                covered: BTreeMap::new(),
            }),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// Restore the engine from the newest snapshot, if there is one, and rewind
    /// `store` to the positions the snapshot covers. Must run before the consumer
    /// seeks from `store`.
    pub async fn restore_latest(&self, store: &dyn OffsetStore) -> Result<bool> {
        let Some(snapshot) = self
            .snapshotter
            .latest_snapshot()
            .await
            .context("failed to load latest snapshot")?
        else {
            info!("No snapshot found, starting from empty engine state");
            return Ok(false);
        };

        info!(
            snapshot_id = %snapshot.id,
            taken_at = %snapshot.taken_at,
            records_applied = snapshot.state.records_applied,
            partitions = snapshot.offsets.len(),
            "Restoring engine from snapshot"
        );
        self.engine
            .restore(snapshot.state)
            .context("failed to restore engine from snapshot")?;
        store
            .rewind_to(&snapshot.offsets)
            .context("failed to rewind offset store to snapshot")?;

        let mut progress = self.progress.lock();
        for entry in &snapshot.offsets {
            progress.cover(entry.partition(), entry.offset());
        }
        Ok(true)
    }

    /// Wait for snapshots that were started but have not finished yet.
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.in_flight.lock());
        for handle in pending {
            if let Err(e) = handle.await {
                error!("Snapshot task panicked: {e:#}");
            }
        }
    }

    fn spawn_snapshot(&self, trigger: SnapshotTrigger, offsets: Vec<PartitionOffset>) {
        // Exported and stamped here so state, offsets and id order all match the
        // record boundary.
        let state = match self.engine.export_state() {
            Ok(state) => state,
            Err(e) => {
                error!(trigger = trigger.as_str(), "Failed to export engine state: {e:#}");
                metrics::counter!(SNAPSHOTS, "outcome" => "failure").increment(1);
                return;
            }
        };

        let snapshot = Snapshot::new(state, offsets);
        let snapshotter = self.snapshotter.clone();
        let handle = tokio::spawn(async move {
            match snapshotter.take_snapshot(snapshot).await {
                Ok(id) => {
                    info!(snapshot_id = %id, trigger = trigger.as_str(), "Snapshot taken");
                    metrics::counter!(SNAPSHOTS, "outcome" => "success").increment(1);
                }
                Err(e) => {
                    error!(trigger = trigger.as_str(), "Snapshot failed: {e:#}");
                    metrics::counter!(SNAPSHOTS, "outcome" => "failure").increment(1);
                }
            }
        });

        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|handle| !handle.is_finished());
        in_flight.push(handle);
    }
}

#[async_trait]
impl RecordHandler for EngineRecordHandler {
    async fn handle(&self, record: &Record, leadership: LeadershipState) -> Result<()> {
        let applied = self.engine.apply(record, leadership).with_context(|| {
            format!(
                "failed to apply record at {} offset {}",
                record.partition, record.offset
            )
        });

        let due = {
            let mut progress = self.progress.lock();
            // The loop skips failed records, so they count as covered too
            progress.cover(&record.partition, record.next_offset());
            applied?;
            progress
                .record_applied(&self.policy, leadership)
                .map(|trigger| (trigger, progress.covered_offsets()))
        };
        if let Some((trigger, offsets)) = due {
            self.spawn_snapshot(trigger, offsets);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyedState {
    values: BTreeMap<String, serde_json::Value>,
    records_applied: u64,
}

/// Keeps the latest JSON value per record key. A record without a value deletes
/// its key.
#[derive(Debug, Default)]
pub struct KeyedStateEngine {
    state: Mutex<KeyedState>,
}

impl KeyedStateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().values.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().values.is_empty()
    }

    pub fn records_applied(&self) -> u64 {
        self.state.lock().records_applied
    }
}

impl ProcessingEngine for KeyedStateEngine {
    fn apply(&self, record: &Record, _leadership: LeadershipState) -> Result<()> {
        let key = record
            .key
            .as_deref()
            .ok_or_else(|| anyhow!("record has no key"))?;
        let key = std::str::from_utf8(key).context("record key is not valid utf-8")?;

        let value = record
            .value
            .as_deref()
            .map(serde_json::from_slice::<serde_json::Value>)
            .transpose()
            .context("record value is not valid json")?;

        let mut state = self.state.lock();
        match value {
            Some(value) => {
                state.values.insert(key.to_string(), value);
            }
            None => {
                state.values.remove(key);
            }
        }
        state.records_applied += 1;
        Ok(())
    }

    fn export_state(&self) -> Result<EngineState> {
        let state = self.state.lock();
        Ok(EngineState {
            records_applied: state.records_applied,
            payload: serde_json::to_value(&state.values)?,
        })
    }

    fn restore(&self, exported: EngineState) -> Result<()> {
        let values = serde_json::from_value(exported.payload)
            .context("snapshot payload is not a keyed state")?;
        *self.state.lock() = KeyedState {
            values,
            records_applied: exported.records_applied,
        };
        Ok(())
    }
}
