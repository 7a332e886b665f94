use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::kafka::rebalance_listener::{PartitionControl, RebalanceListener};
use crate::metrics_consts::OFFSET_COMMITS;
use crate::types::Partition;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// rdkafka context that forwards rebalance callbacks to the [`RebalanceListener`].
///
/// librdkafka invokes these callbacks from within the poll call, on the polling
/// thread, so the listener can seek and commit synchronously.
pub struct HaConsumerContext {
    listener: Arc<RebalanceListener>,
}

impl HaConsumerContext {
    pub fn new(listener: Arc<RebalanceListener>) -> Self {
        Self { listener }
    }
}

impl ClientContext for HaConsumerContext {}

impl ConsumerContext for HaConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let partitions = to_partitions(partitions);
                self.listener.on_partitions_revoked(base_consumer, &partitions);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let partitions = to_partitions(partitions);
                self.listener
                    .on_partitions_assigned(base_consumer, &partitions);
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    // Completion of async commits lands here. No retry: the next commit carries
    // the cumulative offsets anyway.
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            Err(e) => {
                warn!(
                    "Offset commit for {} partitions failed: {}",
                    offsets.count(),
                    e
                );
                metrics::counter!(OFFSET_COMMITS, "mode" => "callback", "outcome" => "failure")
                    .increment(1);
            }
        }
    }
}

fn to_partitions(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements().into_iter().map(Partition::from).collect()
}

pub(crate) fn offsets_to_list(
    offsets: &HashMap<Partition, i64>,
) -> Result<TopicPartitionList, BrokerError> {
    let mut list = TopicPartitionList::new();
    for (partition, next_offset) in offsets {
        list.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(*next_offset),
        )?;
    }
    Ok(list)
}

fn seek_partition<K>(consumer: &K, partition: &Partition, offset: i64) -> Result<(), BrokerError>
where
    K: Consumer<HaConsumerContext>,
{
    consumer
        .seek(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset),
            SEEK_TIMEOUT,
        )
        .map_err(|e| BrokerError::SeekFailed {
            partition: partition.clone(),
            offset,
            reason: e.to_string(),
        })
}

fn commit_partitions<K>(consumer: &K, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError>
where
    K: Consumer<HaConsumerContext>,
{
    if offsets.is_empty() {
        return Ok(());
    }
    let list = offsets_to_list(offsets)?;
    consumer
        .commit(&list, CommitMode::Sync)
        .map_err(|e| BrokerError::CommitFailed(e.to_string()))?;
    info!("Committed offsets for {} partitions", offsets.len());
    Ok(())
}

impl PartitionControl for BaseConsumer<HaConsumerContext> {
    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        seek_partition(self, partition, offset)
    }

    fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError> {
        commit_partitions(self, offsets)
    }
}

impl PartitionControl for StreamConsumer<HaConsumerContext> {
    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        seek_partition(self, partition, offset)
    }

    fn commit_sync(&self, offsets: &HashMap<Partition, i64>) -> Result<(), BrokerError> {
        commit_partitions(self, offsets)
    }
}
