use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::TopicPartitionList;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::kafka::broker::LogConsumer;
use crate::kafka::context::{offsets_to_list, HaConsumerContext};
use crate::kafka::rebalance_listener::RebalanceListener;
use crate::metrics_consts::POLL_ERRORS;
use crate::types::{CommitMode, Partition, Record};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Subscription {
    Group(String),
    Manual(Vec<Partition>),
}

/// [`LogConsumer`] backed by an rdkafka `StreamConsumer`.
pub struct KafkaLogConsumer {
    consumer: Option<StreamConsumer<HaConsumerContext>>,
    listener: Arc<RebalanceListener>,
    subscription: Option<Subscription>,
    drain_timeout: Duration,
}

impl KafkaLogConsumer {
    pub fn new(
        config: &ClientConfig,
        listener: Arc<RebalanceListener>,
        drain_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let context = HaConsumerContext::new(listener.clone());
        let consumer: StreamConsumer<HaConsumerContext> = config.create_with_context(context)?;

        Ok(Self {
            consumer: Some(consumer),
            listener,
            subscription: None,
            drain_timeout,
        })
    }

    fn inner(&self) -> Result<&StreamConsumer<HaConsumerContext>, BrokerError> {
        self.consumer.as_ref().ok_or(BrokerError::Closed)
    }

    fn owns_anything(consumer: &StreamConsumer<HaConsumerContext>) -> bool {
        consumer
            .assignment()
            .map(|list| list.count() > 0)
            .unwrap_or(false)
    }

    /// Keep serving the consumer queue until the revoke callback for the old
    /// subscription has run. Records that arrive meanwhile are discarded: they were
    /// never dispatched, so their offsets were never tracked.
    async fn drain_assignment(&self) -> Result<(), BrokerError> {
        let consumer = self.inner()?;
        let deadline = Instant::now() + self.drain_timeout;

        while Self::owns_anything(consumer) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    "Assignment still present after {:?}, continuing",
                    self.drain_timeout
                );
                break;
            }

            match timeout(remaining.min(DRAIN_POLL_INTERVAL), consumer.recv()).await {
                Ok(Ok(msg)) => {
                    debug!(
                        topic = msg.topic(),
                        partition = msg.partition(),
                        offset = msg.offset(),
                        "Discarding record from drained subscription"
                    );
                }
                Ok(Err(e)) => debug!("Error while draining subscription: {e:#}"),
                Err(_) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.inner()?.subscribe(&[topic])?;
        self.subscription = Some(Subscription::Group(topic.to_string()));
        info!(topic, "Subscribed");
        Ok(())
    }

    fn assign(&mut self, topic: &str) -> Result<Vec<Partition>, BrokerError> {
        let consumer = self.inner()?;
        let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;

        let partitions: Vec<Partition> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == topic)
            .flat_map(|t| t.partitions().iter().map(|p| Partition::new(topic, p.id())))
            .collect();

        if partitions.is_empty() {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }

        let mut list = TopicPartitionList::new();
        for partition in &partitions {
            list.add_partition(partition.topic(), partition.partition_number());
        }
        consumer.assign(&list)?;

        // No group coordination means no rebalance callback, so restore here.
        self.listener.on_partitions_assigned(consumer, &partitions);

        info!(topic, partitions = partitions.len(), "Assigned partitions");
        self.subscription = Some(Subscription::Manual(partitions.clone()));
        Ok(partitions)
    }

    async fn unsubscribe(&mut self) -> Result<(), BrokerError> {
        let Some(subscription) = self.subscription.take() else {
            return Ok(());
        };

        let consumer = self.inner()?;
        match subscription {
            Subscription::Group(topic) => {
                consumer.unsubscribe();
                self.drain_assignment().await?;
                info!(topic = topic.as_str(), "Unsubscribed");
            }
            Subscription::Manual(partitions) => {
                consumer.unassign()?;
                self.listener.on_partitions_revoked(consumer, &partitions);
                info!(partitions = partitions.len(), "Unassigned partitions");
            }
        }
        Ok(())
    }

    async fn poll(
        &mut self,
        max_records: usize,
        poll_timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError> {
        let consumer = self.inner()?;
        let deadline = Instant::now() + poll_timeout;
        let mut records = Vec::with_capacity(max_records);

        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, consumer.recv()).await {
                Ok(Ok(msg)) => records.push(Record::from_borrowed_message(&msg)),
                Ok(Err(e)) => {
                    let err = BrokerError::from(e);
                    if err.is_fatal() {
                        metrics::counter!(POLL_ERRORS, "level" => "fatal").increment(1);
                        return Err(err);
                    }
                    warn!("Kafka consumer error: {err}");
                    metrics::counter!(POLL_ERRORS, "level" => "warn").increment(1);
                    if records.is_empty() {
                        sleep(remaining.min(DRAIN_POLL_INTERVAL)).await;
                    }
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(records)
    }

    fn commit(
        &mut self,
        offsets: &HashMap<Partition, i64>,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let list = offsets_to_list(offsets)?;
        self.inner()?
            .commit(&list, mode.into())
            .map_err(|e: KafkaError| BrokerError::CommitFailed(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            if self.subscription.take().is_some() {
                consumer.unsubscribe();
            }
            // Dropping the consumer closes it and leaves the group.
            drop(consumer);
            info!("Kafka consumer closed");
        }
    }
}
