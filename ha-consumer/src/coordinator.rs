//! Consumption coordinator: the replica's leadership state machine.
//!
//! ```text
//!                 signal(s)                      assignment seen
//!   ┌─────────┐ ───────────► ┌──────────┐ ─────────────────────► ┌─────────┐
//!   │ STOPPED │              │ STARTING │                        │ RUNNING │
//!   └─────────┘ ◄─────────── └──────────┘ ◄───────────────────── └─────────┘
//!        ▲        open failed               assignment lost            │
//!        └─────────────────────────────────────────────────────────────┘
//!                  leadership flip: drain old topic, then open new one
//! ```
//!
//! | old        | new        | topic after     |
//! |------------|------------|-----------------|
//! | NOT_LEADER | LEADER     | leader topic    |
//! | LEADER     | NOT_LEADER | follower topic  |
//! | not started| any        | topic of `new`  |
//! | unchanged  | unchanged  | no-op           |
//!
//! The coordinator is owned by the poll task and is only mutated there. Other
//! threads see it through the [`ConsumerStatus`] watch channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::kafka::broker::LogConsumer;
use crate::kafka::rebalance_listener::RebalanceListener;
use crate::metrics_consts::{
    IS_LEADER, OFFSET_COMMITS, OFFSET_STORE_WRITES, PARTITION_LAST_PERSISTED_OFFSET,
    TOPIC_SWITCHES,
};
use crate::types::{
    ActiveTopic, CommitMode, ConsumerIdentity, ConsumerStatus, LeadershipState, Partition,
    RunState, TopicPair,
};

/// How the replica takes ownership of the active topic's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Join the consumer group and let the broker assign partitions.
    Subscribe,
    /// Take every partition of the topic directly.
    Assign,
}

/// What a leadership signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Started(ActiveTopic),
    Switched { from: ActiveTopic, to: ActiveTopic },
}

pub struct ConsumptionCoordinator<C: LogConsumer> {
    identity: ConsumerIdentity,
    topics: TopicPair,
    consumer: C,
    listener: Arc<RebalanceListener>,
    mode: SubscriptionMode,
    leadership: Option<LeadershipState>,
    run_state: RunState,
    active_topic: Option<ActiveTopic>,
    topic_switches: u64,
    status_tx: watch::Sender<ConsumerStatus>,
}

impl<C: LogConsumer> ConsumptionCoordinator<C> {
    pub fn new(
        identity: ConsumerIdentity,
        topics: TopicPair,
        consumer: C,
        listener: Arc<RebalanceListener>,
        mode: SubscriptionMode,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConsumerStatus::default());
        Self {
            identity,
            topics,
            consumer,
            listener,
            mode,
            leadership: None,
            run_state: RunState::Stopped,
            active_topic: None,
            topic_switches: 0,
            status_tx,
        }
    }

    pub fn status(&self) -> watch::Receiver<ConsumerStatus> {
        self.status_tx.subscribe()
    }

    pub fn identity(&self) -> &ConsumerIdentity {
        &self.identity
    }

    pub fn leadership(&self) -> Option<LeadershipState> {
        self.leadership
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn active_topic(&self) -> Option<ActiveTopic> {
        self.active_topic
    }

    pub fn topic_switches(&self) -> u64 {
        self.topic_switches
    }

    pub fn consumer_mut(&mut self) -> &mut C {
        &mut self.consumer
    }

    pub fn listener(&self) -> &Arc<RebalanceListener> {
        &self.listener
    }

    /// Apply a leadership signal. Must only be called between batches.
    pub async fn on_leadership_change(
        &mut self,
        new_state: LeadershipState,
    ) -> Result<Transition, BrokerError> {
        let target = ActiveTopic::for_leadership(new_state);

        if self.run_state == RunState::Stopped {
            self.leadership = Some(new_state);
            self.open(target)?;
            return Ok(Transition::Started(target));
        }

        if self.leadership == Some(new_state) {
            debug!(
                consumer_id = self.identity.id(),
                state = %new_state,
                "Leadership unchanged, nothing to do"
            );
            return Ok(Transition::Unchanged);
        }

        let from = self.active_topic.unwrap_or(target);
        info!(
            consumer_id = self.identity.id(),
            group_id = self.identity.group_id(),
            from = self.topics.name_of(from),
            to = self.topics.name_of(target),
            state = %new_state,
            "Leadership changed, switching topic"
        );

        self.leadership = Some(new_state);
        self.drain_subscription().await;
        self.open(target)?;

        self.topic_switches += 1;
        metrics::counter!(TOPIC_SWITCHES, "to" => target.as_str()).increment(1);
        self.publish();

        Ok(Transition::Switched { from, to: target })
    }

    /// Promote STARTING to RUNNING once the broker has handed over partitions,
    /// and fall back to STARTING if a group rebalance took them all away.
    pub fn observe_assignment(&mut self) {
        let assigned = self.listener.has_assignment();
        match (self.run_state, assigned) {
            (RunState::Starting, true) => {
                info!(
                    consumer_id = self.identity.id(),
                    partitions = ?self.listener.owned_partitions(),
                    "Assignment complete, running"
                );
                self.run_state = RunState::Running;
                self.publish();
            }
            (RunState::Running, false) => {
                info!(
                    consumer_id = self.identity.id(),
                    "All partitions revoked, waiting for assignment"
                );
                self.run_state = RunState::Starting;
                self.publish();
            }
            _ => {}
        }
    }

    /// The leadership a record from `partition` would be dispatched as, or `None`
    /// when it must not be dispatched at all.
    pub fn dispatch_state(&self, partition: &Partition) -> Option<LeadershipState> {
        if self.run_state != RunState::Running || !self.listener.owns(partition) {
            return None;
        }
        self.leadership
    }

    /// Commit everything tracked so far. Failures are logged only: the next commit
    /// carries the same offsets again, plus whatever was processed since.
    pub fn commit_tracked(&mut self, mode: CommitMode) {
        if self.listener.auto_commit() {
            return;
        }
        let offsets = self.listener.tracker().snapshot();
        if offsets.is_empty() {
            return;
        }

        match self.consumer.commit(&offsets, mode) {
            Ok(()) => {
                debug!(
                    mode = mode.as_str(),
                    partitions = offsets.len(),
                    "Committed tracked offsets"
                );
                metrics::counter!(OFFSET_COMMITS, "mode" => mode.as_str(), "outcome" => "success")
                    .increment(1);
            }
            Err(e) => {
                warn!(
                    mode = mode.as_str(),
                    partitions = offsets.len(),
                    "Offset commit failed, the next commit will include these offsets: {e:#}"
                );
                metrics::counter!(OFFSET_COMMITS, "mode" => mode.as_str(), "outcome" => "failure")
                    .increment(1);
            }
        }
    }

    /// Write the tracked offsets to the offset store.
    pub fn checkpoint(&self) {
        let offsets = self.listener.tracker().snapshot();
        self.persist(&offsets);
    }

    /// Exit sequence: one final synchronous commit attempt, then persistence, then
    /// close. Each step runs even if the previous one failed.
    pub fn shutdown(&mut self) {
        info!(
            consumer_id = self.identity.id(),
            group_id = self.identity.group_id(),
            "Starting exit sequence"
        );

        let offsets = self.listener.tracker().snapshot();
        for (partition, offset) in &offsets {
            debug!(
                consumer_id = self.identity.id(),
                topic = partition.topic(),
                partition = partition.partition_number(),
                last_offset = offset,
                "Final offset"
            );
        }

        match self.consumer.commit(&offsets, CommitMode::Sync) {
            Ok(()) => {
                metrics::counter!(OFFSET_COMMITS, "mode" => "final", "outcome" => "success")
                    .increment(1);
            }
            Err(e) => {
                warn!("Final offset commit failed: {e:#}");
                metrics::counter!(OFFSET_COMMITS, "mode" => "final", "outcome" => "failure")
                    .increment(1);
            }
        }

        self.persist(&offsets);

        info!("Closing consumer");
        self.consumer.close();

        self.run_state = RunState::Stopped;
        self.active_topic = None;
        self.publish();
    }

    fn open(&mut self, target: ActiveTopic) -> Result<(), BrokerError> {
        let topic = self.topics.name_of(target).to_string();

        let opened = match self.mode {
            SubscriptionMode::Subscribe => self
                .consumer
                .subscribe(&topic)
                .map(|()| RunState::Starting),
            // Assignment and offset restore complete inside assign()
            SubscriptionMode::Assign => self.consumer.assign(&topic).map(|_| RunState::Running),
        };

        match opened {
            Ok(run_state) => {
                info!(
                    consumer_id = self.identity.id(),
                    group_id = self.identity.group_id(),
                    topic = topic.as_str(),
                    leadership = ?self.leadership,
                    "Consuming topic"
                );
                self.run_state = run_state;
                self.active_topic = Some(target);
                let is_leader = self.leadership.is_some_and(LeadershipState::is_leader);
                metrics::gauge!(IS_LEADER).set(if is_leader { 1.0 } else { 0.0 });
                self.publish();
                Ok(())
            }
            Err(e) => {
                error!(
                    consumer_id = self.identity.id(),
                    topic = topic.as_str(),
                    "Failed to open subscription: {e:#}"
                );
                self.run_state = RunState::Stopped;
                self.active_topic = None;
                self.publish();
                Err(e)
            }
        }
    }

    /// Stop dispatching, flush what was applied, and leave the current topic
    /// completely before anything else is opened.
    async fn drain_subscription(&mut self) {
        self.run_state = RunState::Stopped;
        self.publish();

        self.commit_tracked(CommitMode::Sync);
        self.checkpoint();

        if let Err(e) = self.consumer.unsubscribe().await {
            warn!("Failed to leave previous subscription cleanly: {e:#}");
        }

        self.listener.tracker().clear_all();
        self.listener.reset_ownership();
    }

    fn persist(&self, offsets: &HashMap<Partition, i64>) {
        if offsets.is_empty() {
            return;
        }
        match self.listener.store().put_all(offsets) {
            Ok(()) => {
                metrics::counter!(OFFSET_STORE_WRITES, "outcome" => "success").increment(1);
                for (partition, offset) in offsets {
                    metrics::gauge!(
                        PARTITION_LAST_PERSISTED_OFFSET,
                        "topic" => partition.topic().to_string(),
                        "partition" => partition.partition_number().to_string()
                    )
                    .set(*offset as f64);
                }
            }
            Err(e) => {
                error!(error = ?e, "Failed to persist offsets");
                metrics::counter!(OFFSET_STORE_WRITES, "outcome" => "failure").increment(1);
            }
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(ConsumerStatus {
            run_state: self.run_state,
            active_topic: self.active_topic,
            leadership: self.leadership,
            topic_switches: self.topic_switches,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::test_utils::{
        create_test_listener, Call, CallLog, MockCluster, MockLogConsumer, RecordingOffsetStore,
    };

    const LEADER_TOPIC: &str = "users-input";
    const FOLLOWER_TOPIC: &str = "master";

    fn setup(mode: SubscriptionMode) -> (ConsumptionCoordinator<MockLogConsumer>, CallLog) {
        let cluster = MockCluster::new();
        cluster.create_topic(LEADER_TOPIC, 2);
        cluster.create_topic(FOLLOWER_TOPIC, 2);

        let calls = CallLog::new();
        let store = Arc::new(RecordingOffsetStore::new(calls.clone()));
        let listener = create_test_listener(store, false);
        let consumer = MockLogConsumer::new(cluster, listener.clone(), calls.clone());

        let coordinator = ConsumptionCoordinator::new(
            ConsumerIdentity::new("replica-1", "ha-group"),
            TopicPair::new(LEADER_TOPIC, FOLLOWER_TOPIC),
            consumer,
            listener,
            mode,
        );
        (coordinator, calls)
    }

    async fn poll_once(coordinator: &mut ConsumptionCoordinator<MockLogConsumer>) {
        coordinator
            .consumer_mut()
            .poll(10, Duration::from_millis(1))
            .await
            .unwrap();
        coordinator.observe_assignment();
    }

    #[tokio::test]
    async fn test_first_signal_starts_without_stop() {
        let (mut coordinator, calls) = setup(SubscriptionMode::Subscribe);

        let transition = coordinator
            .on_leadership_change(LeadershipState::NotLeader)
            .await
            .unwrap();

        assert_eq!(transition, Transition::Started(ActiveTopic::FollowerTopic));
        assert_eq!(coordinator.run_state(), RunState::Starting);
        assert_eq!(coordinator.active_topic(), Some(ActiveTopic::FollowerTopic));
        assert_eq!(
            calls.subscriptions(),
            vec![Call::Subscribe(FOLLOWER_TOPIC.to_string())]
        );
    }

    #[tokio::test]
    async fn test_running_only_after_assignment() {
        let (mut coordinator, _calls) = setup(SubscriptionMode::Subscribe);
        coordinator
            .on_leadership_change(LeadershipState::Leader)
            .await
            .unwrap();

        let partition = Partition::new(LEADER_TOPIC, 0);
        assert_eq!(coordinator.dispatch_state(&partition), None);

        poll_once(&mut coordinator).await;

        assert_eq!(coordinator.run_state(), RunState::Running);
        assert_eq!(
            coordinator.dispatch_state(&partition),
            Some(LeadershipState::Leader)
        );
        // Not owned, never dispatched
        assert_eq!(
            coordinator.dispatch_state(&Partition::new(FOLLOWER_TOPIC, 0)),
            None
        );
    }

    #[tokio::test]
    async fn test_repeated_signal_is_a_noop() {
        let (mut coordinator, calls) = setup(SubscriptionMode::Subscribe);
        coordinator
            .on_leadership_change(LeadershipState::Leader)
            .await
            .unwrap();
        poll_once(&mut coordinator).await;

        let transition = coordinator
            .on_leadership_change(LeadershipState::Leader)
            .await
            .unwrap();

        assert_eq!(transition, Transition::Unchanged);
        assert_eq!(coordinator.run_state(), RunState::Running);
        assert_eq!(calls.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_flip_drains_before_resubscribing() {
        let (mut coordinator, calls) = setup(SubscriptionMode::Subscribe);
        coordinator
            .on_leadership_change(LeadershipState::NotLeader)
            .await
            .unwrap();
        poll_once(&mut coordinator).await;

        let p0 = Partition::new(FOLLOWER_TOPIC, 0);
        coordinator.listener().tracker().mark_processed(&p0, 10);

        let transition = coordinator
            .on_leadership_change(LeadershipState::Leader)
            .await
            .unwrap();

        assert_eq!(
            transition,
            Transition::Switched {
                from: ActiveTopic::FollowerTopic,
                to: ActiveTopic::LeaderTopic
            }
        );
        assert_eq!(coordinator.run_state(), RunState::Starting);
        assert_eq!(coordinator.topic_switches(), 1);
        assert!(coordinator.listener().tracker().is_empty());
        assert!(!coordinator.listener().has_assignment());

        let expected_offsets = BTreeMap::from([(p0, 10)]);
        let calls = calls.calls();
        let commit = calls
            .iter()
            .position(|c| {
                *c == Call::Commit {
                    mode: CommitMode::Sync,
                    offsets: expected_offsets.clone(),
                    succeeded: true,
                }
            })
            .unwrap();
        let persist = calls
            .iter()
            .position(|c| *c == Call::Persist(expected_offsets.clone()))
            .unwrap();
        let unsubscribe = calls
            .iter()
            .position(|c| *c == Call::Unsubscribe(FOLLOWER_TOPIC.to_string()))
            .unwrap();
        let subscribe_leader = calls
            .iter()
            .position(|c| *c == Call::Subscribe(LEADER_TOPIC.to_string()))
            .unwrap();

        assert!(commit < persist);
        assert!(persist < unsubscribe);
        assert!(unsubscribe < subscribe_leader);
    }

    #[tokio::test]
    async fn test_status_is_published() {
        let (mut coordinator, _calls) = setup(SubscriptionMode::Subscribe);
        let status = coordinator.status();
        assert_eq!(status.borrow().run_state, RunState::Stopped);

        coordinator
            .on_leadership_change(LeadershipState::NotLeader)
            .await
            .unwrap();
        poll_once(&mut coordinator).await;

        let current = *status.borrow();
        assert_eq!(current.run_state, RunState::Running);
        assert_eq!(current.active_topic, Some(ActiveTopic::FollowerTopic));
        assert_eq!(current.leadership, Some(LeadershipState::NotLeader));
    }

    #[tokio::test]
    async fn test_assign_mode_runs_immediately() {
        let (mut coordinator, calls) = setup(SubscriptionMode::Assign);

        coordinator
            .on_leadership_change(LeadershipState::Leader)
            .await
            .unwrap();

        assert_eq!(coordinator.run_state(), RunState::Running);
        assert_eq!(
            coordinator.listener().owned_partitions(),
            vec![
                Partition::new(LEADER_TOPIC, 0),
                Partition::new(LEADER_TOPIC, 1)
            ]
        );
        assert_eq!(
            calls.subscriptions(),
            vec![Call::Assign(LEADER_TOPIC.to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_open_leaves_coordinator_stopped() {
        let cluster = MockCluster::new();
        let calls = CallLog::new();
        let store = Arc::new(RecordingOffsetStore::new(calls.clone()));
        let listener = create_test_listener(store, false);
        let consumer = MockLogConsumer::new(cluster, listener.clone(), calls);
        let mut coordinator = ConsumptionCoordinator::new(
            ConsumerIdentity::new("replica-1", "ha-group"),
            TopicPair::new(LEADER_TOPIC, FOLLOWER_TOPIC),
            consumer,
            listener,
            SubscriptionMode::Assign,
        );

        let result = coordinator
            .on_leadership_change(LeadershipState::Leader)
            .await;

        assert!(matches!(result, Err(BrokerError::UnknownTopic(_))));
        assert_eq!(coordinator.run_state(), RunState::Stopped);
        assert_eq!(coordinator.active_topic(), None);
        // Remembered so it can be retried
        assert_eq!(coordinator.leadership(), Some(LeadershipState::Leader));
    }

    #[tokio::test]
    async fn test_shutdown_commits_then_persists_then_closes() {
        let (mut coordinator, calls) = setup(SubscriptionMode::Subscribe);
        coordinator
            .on_leadership_change(LeadershipState::NotLeader)
            .await
            .unwrap();
        poll_once(&mut coordinator).await;

        let p1 = Partition::new(FOLLOWER_TOPIC, 1);
        coordinator.listener().tracker().mark_processed(&p1, 3);
        coordinator
            .consumer_mut()
            .failing_commits()
            .store(1, Ordering::SeqCst);

        coordinator.shutdown();

        let offsets = BTreeMap::from([(p1.clone(), 3)]);
        let calls = calls.calls();
        let tail = &calls[calls.len() - 3..];
        assert_eq!(
            tail,
            &[
                Call::Commit {
                    mode: CommitMode::Sync,
                    offsets: offsets.clone(),
                    succeeded: false,
                },
                Call::Persist(offsets),
                Call::Close,
            ]
        );
        assert_eq!(coordinator.run_state(), RunState::Stopped);
        assert_eq!(coordinator.listener().store().get(&p1).unwrap(), Some(3));
    }
}
