//! Test doubles for the broker, the offset store and the record handler.
//!
//! Used in `mod tests` blocks and by the integration tests under `tests/`. No live
//! broker is involved: [`MockCluster`] holds the log, [`MockLogConsumer`] reads it
//! and fires the rebalance listener the way a group consumer would.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BrokerError;
use crate::handler::RecordHandler;
use crate::kafka::broker::LogConsumer;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::rebalance_listener::{PartitionControl, RebalanceListener};
use crate::offset_store::{InMemoryOffsetStore, OffsetStore, OffsetStoreError};
use crate::types::{CommitMode, LeadershipState, Partition, PartitionOffset, Record};

const IDLE_POLL: Duration = Duration::from_millis(5);

/// Everything the collaborators did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe(String),
    Assign(String),
    Unsubscribe(String),
    Seek(Partition, i64),
    RebalanceCommit(BTreeMap<Partition, i64>),
    Commit {
        mode: CommitMode,
        offsets: BTreeMap<Partition, i64>,
        succeeded: bool,
    },
    Persist(BTreeMap<Partition, i64>),
    Close,
}

#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, call: Call) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn commits(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, Call::Commit { .. }))
            .cloned()
            .collect()
    }

    /// Subscribe, assign and unsubscribe calls only.
    pub fn subscriptions(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    Call::Subscribe(_) | Call::Assign(_) | Call::Unsubscribe(_)
                )
            })
            .cloned()
            .collect()
    }
}

fn sorted(offsets: &HashMap<Partition, i64>) -> BTreeMap<Partition, i64> {
    offsets.iter().map(|(p, o)| (p.clone(), *o)).collect()
}

/// Where a partition without a stored offset starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
}

/// In-memory partitioned log shared between a test and its [`MockLogConsumer`].
#[derive(Debug, Default)]
pub struct MockCluster {
    topics: Mutex<HashMap<String, i32>>,
    log: Mutex<BTreeMap<Partition, Vec<Record>>>,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.topics.lock().insert(topic.to_string(), partitions);
        let mut log = self.log.lock();
        for partition_number in 0..partitions {
            log.entry(Partition::new(topic, partition_number))
                .or_default();
        }
    }

    /// Append a record and return its offset.
    pub fn produce(&self, topic: &str, partition_number: i32, key: &str, value: &str) -> i64 {
        let partition = Partition::new(topic, partition_number);
        let mut log = self.log.lock();
        let records = log.entry(partition.clone()).or_default();
        let offset = records.last().map_or(0, |r| r.offset + 1);
        records.push(Record::new(
            partition,
            offset,
            Some(key.as_bytes().to_vec()),
            Some(value.as_bytes().to_vec()),
        ));
        offset
    }

    /// Append `count` records with JSON values, keys cycling over `key-0..key-9`.
    pub fn produce_many(&self, topic: &str, partition_number: i32, count: usize) {
        for i in 0..count {
            let key = format!("key-{}", i % 10);
            self.produce(topic, partition_number, &key, &i.to_string());
        }
    }

    pub fn partitions_of(&self, topic: &str) -> Vec<Partition> {
        let declared = self.topics.lock().get(topic).copied();
        match declared {
            Some(count) => (0..count).map(|p| Partition::new(topic, p)).collect(),
            None => self
                .log
                .lock()
                .keys()
                .filter(|p| p.topic() == topic)
                .cloned()
                .collect(),
        }
    }

    fn end_offset(&self, partition: &Partition) -> i64 {
        self.log
            .lock()
            .get(partition)
            .and_then(|records| records.last())
            .map_or(0, |r| r.offset + 1)
    }

    fn read(&self, partition: &Partition, from: i64, max: usize) -> Vec<Record> {
        self.log
            .lock()
            .get(partition)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.offset >= from)
                    .take(max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupEvent {
    RevokeAll,
    Reassign,
}

/// Group rebalances injected into a running [`MockLogConsumer`]. Each takes effect
/// at the start of the consumer's next poll.
#[derive(Debug, Clone, Default)]
pub struct RebalanceHandle {
    pending: Arc<Mutex<VecDeque<GroupEvent>>>,
}

impl RebalanceHandle {
    /// The group takes every partition away. Records fetched before the revoke are
    /// still returned by that one poll, as a real client may have them buffered.
    pub fn revoke_all(&self) {
        self.pending.lock().push_back(GroupEvent::RevokeAll);
    }

    /// The group hands the subscribed topic's partitions back.
    pub fn reassign(&self) {
        self.pending.lock().push_back(GroupEvent::Reassign);
    }

    fn take(&self) -> Vec<GroupEvent> {
        self.pending.lock().drain(..).collect()
    }
}

enum MockSubscription {
    Group { topic: String, assigned: bool },
    Manual { topic: String },
}

/// [`LogConsumer`] over a [`MockCluster`].
///
/// With a group subscription the first poll after `subscribe` runs the assignment
/// callback, then returns records. `unsubscribe` runs the revoke callback before
/// returning, so no two subscriptions ever overlap.
pub struct MockLogConsumer {
    cluster: Arc<MockCluster>,
    listener: Arc<RebalanceListener>,
    calls: CallLog,
    subscription: Option<MockSubscription>,
    assigned: Vec<Partition>,
    positions: Mutex<HashMap<Partition, i64>>,
    start_position: StartPosition,
    failing_commits: Arc<AtomicUsize>,
    failing_seeks: HashSet<Partition>,
    block_when_idle: bool,
    unsubscribe_delay: Option<Duration>,
    rebalances: RebalanceHandle,
}

impl MockLogConsumer {
    pub fn new(cluster: Arc<MockCluster>, listener: Arc<RebalanceListener>, calls: CallLog) -> Self {
        Self {
            cluster,
            listener,
            calls,
            subscription: None,
            assigned: Vec::new(),
            positions: Mutex::new(HashMap::new()),
            start_position: StartPosition::Earliest,
            failing_commits: Arc::new(AtomicUsize::new(0)),
            failing_seeks: HashSet::new(),
            block_when_idle: false,
            unsubscribe_delay: None,
            rebalances: RebalanceHandle::default(),
        }
    }

    pub fn with_start_position(mut self, start_position: StartPosition) -> Self {
        self.start_position = start_position;
        self
    }

    /// Polls that find no records wait forever instead of returning empty.
    pub fn with_blocking_polls(mut self) -> Self {
        self.block_when_idle = true;
        self
    }

    /// `unsubscribe` waits this long before revoking, like a client stuck
    /// leaving its group.
    pub fn with_slow_unsubscribe(mut self, delay: Duration) -> Self {
        self.unsubscribe_delay = Some(delay);
        self
    }

    pub fn with_failing_seek(mut self, partition: Partition) -> Self {
        self.failing_seeks.insert(partition);
        self
    }

    /// Shared counter: each explicit commit while it is above zero fails and
    /// decrements it.
    pub fn failing_commits(&self) -> Arc<AtomicUsize> {
        self.failing_commits.clone()
    }

    pub fn rebalance_handle(&self) -> RebalanceHandle {
        self.rebalances.clone()
    }

    pub fn position(&self, partition: &Partition) -> Option<i64> {
        self.positions.lock().get(partition).copied()
    }

    fn take_partitions(&mut self, topic: &str) -> Vec<Partition> {
        let partitions = self.cluster.partitions_of(topic);
        {
            let mut positions = self.positions.lock();
            positions.clear();
            for partition in &partitions {
                let start = match self.start_position {
                    StartPosition::Earliest => 0,
                    StartPosition::Latest => self.cluster.end_offset(partition),
                };
                positions.insert(partition.clone(), start);
            }
        }

        let listener = self.listener.clone();
        listener.on_partitions_assigned(&*self, &partitions);
        self.assigned = partitions.clone();
        partitions
    }

    fn release_partitions(&mut self) {
        let revoked = std::mem::take(&mut self.assigned);
        let listener = self.listener.clone();
        listener.on_partitions_revoked(&*self, &revoked);
        self.positions.lock().clear();
    }

    /// Apply injected group events. Returns the partitions revoked by them, whose
    /// buffered records the current poll still hands out.
    fn apply_group_events(&mut self) -> Vec<Partition> {
        let mut buffered = Vec::new();
        for event in self.rebalances.take() {
            match event {
                GroupEvent::RevokeAll => {
                    // Positions survive so the buffered records can still be read
                    let revoked = std::mem::take(&mut self.assigned);
                    let listener = self.listener.clone();
                    listener.on_partitions_revoked(&*self, &revoked);
                    buffered = revoked;
                }
                GroupEvent::Reassign => {
                    let topic = match &self.subscription {
                        Some(MockSubscription::Group { topic, .. }) => Some(topic.clone()),
                        _ => None,
                    };
                    if let Some(topic) = topic {
                        self.take_partitions(&topic);
                        buffered.clear();
                    }
                }
            }
        }
        buffered
    }

    fn read_batch(&self, partitions: &[Partition], max_records: usize) -> Vec<Record> {
        let mut batch = Vec::new();
        let mut positions = self.positions.lock();
        for partition in partitions {
            let remaining = max_records - batch.len();
            if remaining == 0 {
                break;
            }
            let from = positions.get(partition).copied().unwrap_or(0);
            let records = self.cluster.read(partition, from, remaining);
            if let Some(last) = records.last() {
                positions.insert(partition.clone(), last.offset + 1);
            }
            batch.extend(records);
        }
        batch
    }
}

impl PartitionControl for MockLogConsumer {
    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        self.calls.push(Call::Seek(partition.clone(), offset));
        if self.failing_seeks.contains(partition) {
            return Err(BrokerError::SeekFailed {
                partition: partition.clone(),
                offset,
                reason: "offset out of range".to_string(),
            });
        }
        self.positions.lock().insert(partition.clone(), offset);
        Ok(())
    }

    fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError> {
        self.calls.push(Call::RebalanceCommit(sorted(offsets)));
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for MockLogConsumer {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.calls.push(Call::Subscribe(topic.to_string()));
        self.subscription = Some(MockSubscription::Group {
            topic: topic.to_string(),
            assigned: false,
        });
        Ok(())
    }

    fn assign(&mut self, topic: &str) -> Result<Vec<Partition>, BrokerError> {
        self.calls.push(Call::Assign(topic.to_string()));
        let partitions = self.take_partitions(topic);
        if partitions.is_empty() {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        self.subscription = Some(MockSubscription::Manual {
            topic: topic.to_string(),
        });
        Ok(partitions)
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        if let Some(delay) = self.unsubscribe_delay {
            tokio::time::sleep(delay).await;
        }
        let Some(subscription) = self.subscription.take() else {
            return Ok(());
        };
        let topic = match subscription {
            MockSubscription::Group { topic, .. } | MockSubscription::Manual { topic } => topic,
        };
        self.release_partitions();
        self.calls.push(Call::Unsubscribe(topic));
        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        let buffered = self.apply_group_events();

        let pending_topic = match &self.subscription {
            Some(MockSubscription::Group {
                topic,
                assigned: false,
            }) => Some(topic.clone()),
            _ => None,
        };
        if let Some(topic) = pending_topic {
            self.take_partitions(&topic);
            self.subscription = Some(MockSubscription::Group {
                topic,
                assigned: true,
            });
        }

        let batch = if buffered.is_empty() {
            self.read_batch(&self.assigned, max_records)
        } else {
            self.read_batch(&buffered, max_records)
        };
        if batch.is_empty() {
            if self.block_when_idle {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(timeout.min(IDLE_POLL)).await;
        }
        Ok(batch)
    }

    fn commit(
        &mut self,
        offsets: &HashMap<Partition, i64>,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        let fail = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.calls.push(Call::Commit {
            mode,
            offsets: sorted(offsets),
            succeeded: !fail,
        });
        if fail {
            return Err(BrokerError::CommitFailed("injected commit failure".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.subscription = None;
        self.assigned.clear();
        self.calls.push(Call::Close);
    }
}

/// [`OffsetStore`] that logs every batch write to a [`CallLog`].
pub struct RecordingOffsetStore {
    inner: InMemoryOffsetStore,
    calls: CallLog,
}

impl RecordingOffsetStore {
    pub fn new(calls: CallLog) -> Self {
        Self {
            inner: InMemoryOffsetStore::new(),
            calls,
        }
    }
}

impl OffsetStore for RecordingOffsetStore {
    fn put(&self, partition: &Partition, offset: i64) -> Result<(), OffsetStoreError> {
        self.inner.put(partition, offset)
    }

    fn get(&self, partition: &Partition) -> Result<Option<i64>, OffsetStoreError> {
        self.inner.get(partition)
    }

    fn entries(&self) -> Result<Vec<PartitionOffset>, OffsetStoreError> {
        self.inner.entries()
    }

    fn put_all(&self, offsets: &HashMap<Partition, i64>) -> Result<(), OffsetStoreError> {
        self.calls.push(Call::Persist(sorted(offsets)));
        self.inner.put_all(offsets)
    }
}

/// [`RecordHandler`] that remembers what it was given, and fails on request.
#[derive(Default)]
pub struct RecordingHandler {
    handled: Mutex<Vec<(Record, LeadershipState)>>,
    failing: Mutex<HashSet<(Partition, i64)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, partition: Partition, offset: i64) {
        self.failing.lock().insert((partition, offset));
    }

    pub fn handled(&self) -> Vec<(Record, LeadershipState)> {
        self.handled.lock().clone()
    }

    pub fn offsets_for(&self, partition: &Partition) -> Vec<i64> {
        self.handled
            .lock()
            .iter()
            .filter(|(record, _)| &record.partition == partition)
            .map(|(record, _)| record.offset)
            .collect()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, record: &Record, leadership: LeadershipState) -> Result<()> {
        if self
            .failing
            .lock()
            .contains(&(record.partition.clone(), record.offset))
        {
            return Err(anyhow!(
                "refusing record {} at offset {}",
                record.partition,
                record.offset
            ));
        }
        self.handled.lock().push((record.clone(), leadership));
        Ok(())
    }
}

/// A listener over a fresh tracker and the given store.
pub fn create_test_listener(
    store: Arc<dyn OffsetStore>,
    auto_commit: bool,
) -> Arc<RebalanceListener> {
    Arc::new(RebalanceListener::new(
        store,
        Arc::new(OffsetTracker::new()),
        auto_commit,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_consumer_assigns_on_first_poll() {
        let cluster = MockCluster::new();
        cluster.create_topic("master", 2);
        cluster.produce_many("master", 0, 3);
        cluster.produce_many("master", 1, 2);

        let calls = CallLog::new();
        let store = Arc::new(RecordingOffsetStore::new(calls.clone()));
        store.put(&Partition::new("master", 0), 1).unwrap();
        let listener = create_test_listener(store, false);

        let mut consumer = MockLogConsumer::new(cluster, listener.clone(), calls.clone());
        consumer.subscribe("master").unwrap();
        assert!(!listener.has_assignment());

        let batch = consumer.poll(10, Duration::from_millis(10)).await.unwrap();

        assert!(listener.has_assignment());
        let offsets: Vec<(i32, i64)> = batch
            .iter()
            .map(|r| (r.partition_number(), r.offset))
            .collect();
        assert_eq!(offsets, vec![(0, 1), (0, 2), (1, 0), (1, 1)]);
        assert!(calls
            .calls()
            .contains(&Call::Seek(Partition::new("master", 0), 1)));
    }

    #[tokio::test]
    async fn test_mock_consumer_unsubscribe_revokes() {
        let cluster = MockCluster::new();
        cluster.create_topic("master", 1);

        let calls = CallLog::new();
        let listener = create_test_listener(Arc::new(InMemoryOffsetStore::new()), false);
        let mut consumer = MockLogConsumer::new(cluster, listener.clone(), calls.clone());

        consumer.subscribe("master").unwrap();
        consumer.poll(1, Duration::from_millis(1)).await.unwrap();
        consumer.unsubscribe().await.unwrap();

        assert!(!listener.has_assignment());
        assert_eq!(
            calls.subscriptions(),
            vec![
                Call::Subscribe("master".to_string()),
                Call::Unsubscribe("master".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_injected_revoke_returns_buffered_records_once() {
        let cluster = MockCluster::new();
        cluster.create_topic("master", 1);
        cluster.produce_many("master", 0, 2);

        let calls = CallLog::new();
        let listener = create_test_listener(Arc::new(InMemoryOffsetStore::new()), false);
        let mut consumer = MockLogConsumer::new(cluster.clone(), listener.clone(), calls);
        let rebalances = consumer.rebalance_handle();

        consumer.subscribe("master").unwrap();
        assert_eq!(consumer.poll(10, Duration::from_millis(1)).await.unwrap().len(), 2);

        cluster.produce_many("master", 0, 1);
        rebalances.revoke_all();
        let buffered = consumer.poll(10, Duration::from_millis(1)).await.unwrap();
        assert_eq!(buffered.len(), 1);
        assert_eq!(buffered[0].offset, 2);
        assert!(!listener.has_assignment());
        assert!(consumer
            .poll(10, Duration::from_millis(1))
            .await
            .unwrap()
            .is_empty());

        rebalances.reassign();
        consumer.poll(10, Duration::from_millis(1)).await.unwrap();
        assert!(listener.owns(&Partition::new("master", 0)));
    }

    #[test]
    fn test_injected_commit_failures() {
        let cluster = MockCluster::new();
        let calls = CallLog::new();
        let listener = create_test_listener(Arc::new(InMemoryOffsetStore::new()), false);
        let mut consumer = MockLogConsumer::new(cluster, listener, calls.clone());
        consumer.failing_commits().store(1, Ordering::SeqCst);

        let offsets = HashMap::from([(Partition::new("master", 0), 5)]);
        assert!(consumer.commit(&offsets, CommitMode::Async).is_err());
        assert!(consumer.commit(&offsets, CommitMode::Async).is_ok());

        let succeeded: Vec<bool> = calls
            .commits()
            .into_iter()
            .map(|call| matches!(call, Call::Commit { succeeded: true, .. }))
            .collect();
        assert_eq!(succeeded, vec![false, true]);
    }
}
