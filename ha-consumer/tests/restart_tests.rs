use std::sync::Arc;
use std::time::Duration;

use ha_consumer::error::BrokerError;
use ha_consumer::handler::{EngineRecordHandler, KeyedStateEngine};
use ha_consumer::offset_store::{InMemoryOffsetStore, OffsetStore};
use ha_consumer::snapshot::{LocalSnapshotter, SnapshotPolicy, Snapshotter};
use ha_consumer::test_utils::{create_test_listener, CallLog, MockCluster, MockLogConsumer};
use ha_consumer::types::{ConsumerIdentity, TopicPair};
use ha_consumer::{
    leadership_channel, CommitMode, ConsumptionCoordinator, LeadershipState, LoopSummary,
    Partition, PollLoop, RunDuration, SubscriptionMode,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LEADER_TOPIC: &str = "users-input";
const FOLLOWER_TOPIC: &str = "master";
const POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// State that outlives a single replica process: the log, the offset store and
/// the snapshot directory.
struct Durable {
    cluster: Arc<MockCluster>,
    store: Arc<InMemoryOffsetStore>,
    snapshots: tempfile::TempDir,
}

struct Replica {
    engine: Arc<KeyedStateEngine>,
    handler: Arc<EngineRecordHandler>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<LoopSummary, BrokerError>>,
}

impl Durable {
    fn new() -> Self {
        let cluster = MockCluster::new();
        cluster.create_topic(LEADER_TOPIC, 1);
        cluster.create_topic(FOLLOWER_TOPIC, 1);
        Self {
            cluster,
            store: Arc::new(InMemoryOffsetStore::new()),
            snapshots: tempfile::tempdir().unwrap(),
        }
    }

    fn snapshotter(&self) -> Arc<LocalSnapshotter> {
        Arc::new(LocalSnapshotter::new(self.snapshots.path(), 3))
    }

    /// Start a replica the way the service does: restore, then consume.
    async fn start_replica(&self, state: LeadershipState) -> (Replica, bool) {
        let policy = SnapshotPolicy {
            every_records: 3,
            interval: None,
            on_leadership_change: false,
        };
        let engine = Arc::new(KeyedStateEngine::new());
        let handler = Arc::new(EngineRecordHandler::new(
            engine.clone(),
            self.snapshotter(),
            policy,
        ));
        let restored = handler.restore_latest(self.store.as_ref()).await.unwrap();

        let listener = create_test_listener(self.store.clone(), false);
        let consumer =
            MockLogConsumer::new(self.cluster.clone(), listener.clone(), CallLog::new());
        let coordinator = ConsumptionCoordinator::new(
            ConsumerIdentity::new("replica-1", "ha-group"),
            TopicPair::new(LEADER_TOPIC, FOLLOWER_TOPIC),
            consumer,
            listener,
            SubscriptionMode::Subscribe,
        );
        let (notifier, watcher) = leadership_channel();
        let cancel = CancellationToken::new();
        let poll_loop = PollLoop::new(
            coordinator,
            handler.clone(),
            watcher,
            cancel.clone(),
            POLL_TIMEOUT,
        );
        notifier.on_leadership_change(state);
        let handle = tokio::spawn(poll_loop.run(100, RunDuration::Unbounded, CommitMode::Sync));

        (
            Replica {
                engine,
                handler,
                cancel,
                handle,
            },
            restored,
        )
    }
}

impl Replica {
    async fn wait_for_applied(&self, count: u64) {
        let engine = self.engine.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            while engine.records_applied() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("records not applied in time");
    }

    async fn stop(self) -> Arc<KeyedStateEngine> {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("poll loop did not exit in time")
            .expect("poll loop panicked")
            .expect("poll loop failed");
        self.handler.flush().await;
        self.engine
    }
}

#[tokio::test]
async fn test_restart_replays_records_after_last_snapshot() {
    let durable = Durable::new();
    durable.cluster.produce_many(FOLLOWER_TOPIC, 0, 5);
    let master_p0 = Partition::new(FOLLOWER_TOPIC, 0);

    let (first, restored) = durable.start_replica(LeadershipState::NotLeader).await;
    assert!(!restored);
    first.wait_for_applied(5).await;
    first.stop().await;

    // The store ran ahead of the only snapshot, which was cut after three records
    assert_eq!(durable.store.get(&master_p0).unwrap(), Some(5));
    let latest = durable.snapshotter().latest_snapshot().await.unwrap().unwrap();
    assert_eq!(latest.state.records_applied, 3);

    let (second, restored) = durable.start_replica(LeadershipState::NotLeader).await;
    assert!(restored);
    second.wait_for_applied(5).await;
    let engine = second.stop().await;

    assert_eq!(engine.records_applied(), 5);
    for i in 0..5 {
        assert_eq!(engine.get(&format!("key-{i}")), Some(json!(i)));
    }
    assert_eq!(durable.store.get(&master_p0).unwrap(), Some(5));
}

#[tokio::test]
async fn test_restart_after_switch_replays_topic_missing_from_snapshot() {
    let durable = Durable::new();
    durable.cluster.produce_many(FOLLOWER_TOPIC, 0, 3);
    durable.cluster.produce(LEADER_TOPIC, 0, "user-1", r#"{"plan":"pro"}"#);
    let leader_p0 = Partition::new(LEADER_TOPIC, 0);

    // Follower records trigger the snapshot; the leader record arrives after it
    let (first, _) = durable.start_replica(LeadershipState::NotLeader).await;
    first.wait_for_applied(3).await;
    first.stop().await;
    let (second, _) = durable.start_replica(LeadershipState::Leader).await;
    second.wait_for_applied(4).await;
    second.stop().await;
    assert_eq!(durable.store.get(&leader_p0).unwrap(), Some(1));

    let (third, restored) = durable.start_replica(LeadershipState::Leader).await;
    assert!(restored);
    third.wait_for_applied(4).await;
    let engine = third.stop().await;

    assert_eq!(engine.get("user-1"), Some(json!({"plan": "pro"})));
    assert_eq!(engine.records_applied(), 4);
}
