use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordinator::ConsumptionCoordinator;
use crate::handler::{EngineRecordHandler, KeyedStateEngine};
use crate::kafka::consumer::KafkaLogConsumer;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::rebalance_listener::RebalanceListener;
use crate::leadership::{leadership_channel, LeadershipNotifier};
use crate::offset_store::{FileOffsetStore, InMemoryOffsetStore, OffsetStore};
use crate::poll_loop::{LoopSummary, PollLoop};
use crate::snapshot::LocalSnapshotter;
use crate::types::ConsumerStatus;

/// One replica: Kafka consumer, offset store, engine and the poll loop that ties
/// them together.
pub struct HaConsumerService {
    config: Config,
    poll_loop: PollLoop<KafkaLogConsumer>,
    handler: Arc<EngineRecordHandler>,
    leadership: LeadershipNotifier,
    status: watch::Receiver<ConsumerStatus>,
    shutdown: CancellationToken,
}

impl HaConsumerService {
    /// Build every component. The engine is restored from the latest snapshot and
    /// the offset store rewound to match it before the consumer is created.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for consumer '{}' in group '{}'",
                config.consumer_id, config.kafka_consumer_group
            )
        })?;

        let store: Arc<dyn OffsetStore> = match config.offset_store_path() {
            Some(path) => {
                let store = FileOffsetStore::open(&path).with_context(|| {
                    format!("Failed to open offset store at {}", path.display())
                })?;
                info!(path = %path.display(), "Using file offset store");
                Arc::new(store)
            }
            None => {
                warn!("OFFSET_STORE_PATH not set, offsets are kept in memory only");
                Arc::new(InMemoryOffsetStore::new())
            }
        };

        let engine = Arc::new(KeyedStateEngine::new());
        let snapshotter = Arc::new(LocalSnapshotter::new(
            config.snapshot_dir(),
            config.max_snapshots,
        ));
        let handler = Arc::new(EngineRecordHandler::new(
            engine,
            snapshotter,
            config.snapshot_policy()?,
        ));
        handler
            .restore_latest(store.as_ref())
            .await
            .context("Failed to restore engine state")?;

        let tracker = Arc::new(OffsetTracker::new());
        let listener = Arc::new(RebalanceListener::new(
            store,
            tracker,
            config.kafka_consumer_auto_commit,
        ));

        let consumer = KafkaLogConsumer::new(
            &config.to_consumer_config(),
            listener.clone(),
            config.drain_timeout(),
        )
        .with_context(|| {
            format!(
                "Failed to create Kafka consumer for group '{}' on {}",
                config.kafka_consumer_group, config.kafka_hosts
            )
        })?;

        let coordinator = ConsumptionCoordinator::new(
            config.identity(),
            config.topics()?,
            consumer,
            listener,
            config.subscription_mode(),
        );
        let status = coordinator.status();

        let (leadership, watcher) = leadership_channel();
        let shutdown = CancellationToken::new();

        let poll_loop = PollLoop::new(
            coordinator,
            handler.clone(),
            watcher,
            shutdown.clone(),
            config.poll_timeout()?,
        );

        Ok(Self {
            config,
            poll_loop,
            handler,
            leadership,
            status,
            shutdown,
        })
    }

    /// Handle for the election mechanism. Cloneable, usable from any thread.
    pub fn leadership_notifier(&self) -> LeadershipNotifier {
        self.leadership.clone()
    }

    pub fn status(&self) -> watch::Receiver<ConsumerStatus> {
        self.status.clone()
    }

    /// Run until SIGINT/SIGTERM, the configured run duration, or a fatal error.
    pub async fn run(self) -> Result<LoopSummary> {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => token.cancel(),
                Err(e) => warn!("Failed to install signal handlers: {e:#}"),
            }
        });

        self.run_inner().await
    }

    /// Run until `shutdown_signal` completes (useful for testing)
    pub async fn run_with_shutdown(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<LoopSummary> {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal.await;
            token.cancel();
        });

        self.run_inner().await
    }

    async fn run_inner(self) -> Result<LoopSummary> {
        info!(
            consumer_id = self.config.consumer_id.as_str(),
            group_id = self.config.kafka_consumer_group.as_str(),
            leader_topic = self.config.leader_topic.as_str(),
            follower_topic = self.config.follower_topic.as_str(),
            "Starting HA consumer service"
        );

        if let Some(initial) = self.config.initial_leadership()? {
            info!(state = %initial, "Applying initial leadership from configuration");
            self.leadership.on_leadership_change(initial);
        }

        let summary = self
            .poll_loop
            .run(
                self.config.poll_batch_size,
                self.config.run_duration(),
                self.config.commit_mode()?,
            )
            .await
            .context("Poll loop stopped with a fatal broker error")?;

        self.handler.flush().await;

        info!(
            exit_reason = ?summary.exit_reason,
            dispatched = summary.records_dispatched,
            topic_switches = summary.topic_switches,
            "HA consumer service stopped"
        );
        Ok(summary)
    }
}

pub async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}
