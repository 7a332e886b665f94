use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::PartitionOffset;

pub type SnapshotId = Uuid;

const SNAPSHOT_EXTENSION: &str = "json";

/// Processing engine state exported at a record boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub records_applied: u64,
    pub payload: serde_json::Value,
}

/// Engine state together with the log positions it covers. Restoring the state
/// means resuming every partition from `offsets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub taken_at: DateTime<Utc>,
    /// Next offset to read per partition, as of the record the state was cut at.
    #[serde(default)]
    pub offsets: Vec<PartitionOffset>,
    pub state: EngineState,
}

impl Snapshot {
    /// Stamp a new snapshot. Ids are UUIDv7 and order snapshots by creation, so
    /// create them in the order the states were exported.
    pub fn new(state: EngineState, offsets: Vec<PartitionOffset>) -> Self {
        Self {
            id: Uuid::now_v7(),
            taken_at: Utc::now(),
            offsets,
            state,
        }
    }
}

/// Durable storage for engine snapshots.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    async fn take_snapshot(&self, snapshot: Snapshot) -> Result<SnapshotId>;

    /// The most recent snapshot, if any was ever taken.
    async fn latest_snapshot(&self) -> Result<Option<Snapshot>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTrigger {
    RecordCount,
    Interval,
    LeadershipChange,
}

impl SnapshotTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotTrigger::RecordCount => "record_count",
            SnapshotTrigger::Interval => "interval",
            SnapshotTrigger::LeadershipChange => "leadership_change",
        }
    }
}

/// When the record handler asks for a snapshot. Zero / `None` disable a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub every_records: u64,
    pub interval: Option<Duration>,
    pub on_leadership_change: bool,
}

impl SnapshotPolicy {
    pub fn disabled() -> Self {
        Self {
            every_records: 0,
            interval: None,
            on_leadership_change: false,
        }
    }

    /// Decide whether the record just applied should be followed by a snapshot.
    /// A leadership change wins over the other triggers.
    pub fn trigger(
        &self,
        records_since_last: u64,
        since_last: Duration,
        leadership_changed: bool,
    ) -> Option<SnapshotTrigger> {
        if self.on_leadership_change && leadership_changed {
            return Some(SnapshotTrigger::LeadershipChange);
        }
        if self.every_records > 0 && records_since_last >= self.every_records {
            return Some(SnapshotTrigger::RecordCount);
        }
        match self.interval {
            Some(interval) if !interval.is_zero() && since_last >= interval => {
                Some(SnapshotTrigger::Interval)
            }
            _ => None,
        }
    }
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every_records: 1000,
            interval: None,
            on_leadership_change: true,
        }
    }
}

/// Keeps snapshots as `<id>.json` files in a local directory.
///
/// File names sort in the order snapshots were created, whatever order the writes
/// finish in. Only the newest `max_snapshots` files are kept.
pub struct LocalSnapshotter {
    dir: PathBuf,
    max_snapshots: usize,
    // Serializes writes against pruning
    write_lock: Mutex<()>,
}

impl LocalSnapshotter {
    pub fn new(dir: impl Into<PathBuf>, max_snapshots: usize) -> Self {
        Self {
            dir: dir.into(),
            max_snapshots: max_snapshots.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Snapshot ids present on disk, oldest first.
    pub async fn list(&self) -> Result<Vec<SnapshotId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read snapshot directory {}", self.dir.display())
                })
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match Uuid::parse_str(stem) {
                Ok(id) => ids.push(id),
                Err(_) => debug!(path = %path.display(), "Ignoring unrelated file in snapshot dir"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path_for(&self, id: SnapshotId) -> PathBuf {
        self.dir.join(format!("{id}.{SNAPSHOT_EXTENSION}"))
    }

    async fn prune(&self) -> Result<()> {
        let ids = self.list().await?;
        if ids.len() <= self.max_snapshots {
            return Ok(());
        }
        let excess = ids.len() - self.max_snapshots;
        for id in &ids[..excess] {
            let path = self.path_for(*id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), "Failed to remove old snapshot: {e:#}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for LocalSnapshotter {
    async fn take_snapshot(&self, snapshot: Snapshot) -> Result<SnapshotId> {
        let _guard = self.write_lock.lock().await;

        let bytes = serde_json::to_vec(&snapshot).context("failed to encode snapshot")?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.path_for(snapshot.id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move snapshot into {}", path.display()))?;

        info!(
            snapshot_id = %snapshot.id,
            records_applied = snapshot.state.records_applied,
            partitions = snapshot.offsets.len(),
            "Snapshot written"
        );

        self.prune().await?;
        Ok(snapshot.id)
    }

    async fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        let Some(id) = self.list().await?.pop() else {
            return Ok(None);
        };
        let path = self.path_for(id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("corrupt snapshot {}", path.display()))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Partition;
    use serde_json::json;

    fn state(applied: u64) -> EngineState {
        EngineState {
            records_applied: applied,
            payload: json!({ "applied": applied }),
        }
    }

    fn snapshot(applied: u64) -> Snapshot {
        let offsets = vec![PartitionOffset::new(
            Partition::new("master", 0),
            applied as i64,
        )];
        Snapshot::new(state(applied), offsets)
    }

    #[test]
    fn test_policy_triggers() {
        let policy = SnapshotPolicy {
            every_records: 10,
            interval: Some(Duration::from_secs(60)),
            on_leadership_change: true,
        };

        assert_eq!(policy.trigger(3, Duration::from_secs(1), false), None);
        assert_eq!(
            policy.trigger(10, Duration::from_secs(1), false),
            Some(SnapshotTrigger::RecordCount)
        );
        assert_eq!(
            policy.trigger(1, Duration::from_secs(61), false),
            Some(SnapshotTrigger::Interval)
        );
        assert_eq!(
            policy.trigger(10, Duration::from_secs(61), true),
            Some(SnapshotTrigger::LeadershipChange)
        );
    }

    #[test]
    fn test_disabled_policy_never_triggers() {
        let policy = SnapshotPolicy::disabled();
        assert_eq!(policy.trigger(u64::MAX, Duration::from_secs(3600), true), None);
    }

    #[tokio::test]
    async fn test_latest_snapshot_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = LocalSnapshotter::new(dir.path().join("missing"), 3);

        assert!(snapshotter.latest_snapshot().await.unwrap().is_none());
        assert!(snapshotter.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_and_read_latest() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = LocalSnapshotter::new(dir.path(), 3);

        snapshotter.take_snapshot(snapshot(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let id = snapshotter.take_snapshot(snapshot(2)).await.unwrap();

        let latest = snapshotter.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.state, state(2));
        assert_eq!(
            latest.offsets,
            vec![PartitionOffset::new(Partition::new("master", 0), 2)]
        );
    }

    #[tokio::test]
    async fn test_latest_follows_creation_order_not_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = LocalSnapshotter::new(dir.path(), 3);

        let older = snapshot(3);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let newer = snapshot(6);

        // The newer write lands first
        snapshotter.take_snapshot(newer.clone()).await.unwrap();
        snapshotter.take_snapshot(older.clone()).await.unwrap();

        let latest = snapshotter.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
        assert_eq!(latest.state.records_applied, 6);
        assert_eq!(snapshotter.list().await.unwrap(), vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn test_reads_snapshot_without_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::now_v7();
        let body = json!({
            "id": id,
            "taken_at": "2026-01-01T00:00:00Z",
            "state": { "records_applied": 4, "payload": {} },
        });
        std::fs::write(
            dir.path().join(format!("{id}.json")),
            serde_json::to_vec(&body).unwrap(),
        )
        .unwrap();

        let snapshotter = LocalSnapshotter::new(dir.path(), 3);
        let latest = snapshotter.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert!(latest.offsets.is_empty());
        assert_eq!(latest.state.records_applied, 4);
    }

    #[tokio::test]
    async fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let snapshotter = LocalSnapshotter::new(dir.path(), 2);

        let mut ids = Vec::new();
        for applied in 0..5 {
            ids.push(snapshotter.take_snapshot(snapshot(applied)).await.unwrap());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let kept = snapshotter.list().await.unwrap();
        assert_eq!(kept, ids[3..].to_vec());
    }

    #[tokio::test]
    async fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("not-a-uuid.json"), b"{}").unwrap();

        let snapshotter = LocalSnapshotter::new(dir.path(), 2);
        assert!(snapshotter.latest_snapshot().await.unwrap().is_none());
    }
}
