use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::types::{CommitMode, Partition, Record};

/// The partitioned-log consumer the poll loop drives.
///
/// Implementations are owned by the poll task and are never shared across tasks.
/// Rebalance callbacks fire from inside `poll` (group subscription) or `assign`
/// (manual assignment) and reach the `RebalanceListener` the implementation was
/// built with.
#[async_trait]
pub trait LogConsumer: Send {
    /// Join the consumer group on a single topic.
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    /// Take every partition of `topic` without group coordination. Returns the
    /// partitions that were assigned.
    fn assign(&mut self, topic: &str) -> Result<Vec<Partition>, BrokerError>;

    /// Leave the current subscription or assignment and wait until the broker
    /// client no longer owns any partition of it.
    async fn unsubscribe(&mut self) -> Result<(), BrokerError>;

    /// Return up to `max_records` records, waiting at most `timeout`. Within one
    /// partition records come back in offset order.
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, BrokerError>;

    /// Commit the given next-offsets. With `CommitMode::Async` the call returns
    /// immediately and failures are only reported through logging.
    fn commit(
        &mut self,
        offsets: &HashMap<Partition, i64>,
        mode: CommitMode,
    ) -> Result<(), BrokerError>;

    fn close(&mut self);
}

/// Result of one poll attempt that may be interrupted by shutdown.
#[derive(Debug)]
pub enum PollOutcome {
    Batch(Vec<Record>),
    Cancelled,
}

/// Poll once, giving up as soon as `cancel` fires. The in-flight poll future is
/// dropped on cancellation, so shutdown never waits for the poll timeout.
pub async fn poll_or_cancel<C>(
    consumer: &mut C,
    cancel: &CancellationToken,
    max_records: usize,
    timeout: Duration,
) -> Result<PollOutcome, BrokerError>
where
    C: LogConsumer + ?Sized,
{
    if cancel.is_cancelled() {
        return Ok(PollOutcome::Cancelled);
    }

    tokio::select! {
        biased;

        _ = cancel.cancelled() => Ok(PollOutcome::Cancelled),

        result = consumer.poll(max_records, timeout) => result.map(PollOutcome::Batch),
    }
}
