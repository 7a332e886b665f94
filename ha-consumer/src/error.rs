use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::types::Partition;

/// Raised while loading or validating configuration. The process must not start
/// when one of these is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration from environment: {0}")]
    Env(#[from] envconfig::Error),

    #[error("invalid time unit '{value}' for {field}")]
    InvalidTimeUnit { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("leader and follower topics must differ, both are '{0}'")]
    SameTopics(String),
}

/// Errors surfaced by the broker client contract.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("seek to offset {offset} failed for {partition}: {reason}")]
    SeekFailed {
        partition: Partition,
        offset: i64,
        reason: String,
    },

    #[error("no metadata available for topic '{0}'")]
    UnknownTopic(String),

    #[error("consumer is not subscribed to any topic")]
    NotSubscribed,

    #[error("consumer has been closed")]
    Closed,

    #[error("fatal consumption error: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Fatal errors end the poll loop. Everything else is logged and retried on the
    /// next cycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::Closed | BrokerError::Fatal(_) => true,
            BrokerError::Kafka(e) => is_fatal_kafka_error(e),
            BrokerError::CommitFailed(_)
            | BrokerError::SeekFailed { .. }
            | BrokerError::UnknownTopic(_)
            | BrokerError::NotSubscribed => false,
        }
    }
}

fn is_fatal_kafka_error(e: &KafkaError) -> bool {
    match e {
        KafkaError::MessageConsumptionFatal(_) | KafkaError::Canceled => true,
        KafkaError::Global(code) => matches!(code, RDKafkaErrorCode::Authentication),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BrokerError::Closed.is_fatal());
        assert!(BrokerError::Fatal("boom".to_string()).is_fatal());
        assert!(BrokerError::Kafka(KafkaError::Canceled).is_fatal());
        assert!(BrokerError::Kafka(KafkaError::Global(RDKafkaErrorCode::Authentication)).is_fatal());

        assert!(!BrokerError::CommitFailed("rebalance".to_string()).is_fatal());
        assert!(!BrokerError::NotSubscribed.is_fatal());
        assert!(
            !BrokerError::Kafka(KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)).is_fatal()
        );
        assert!(!BrokerError::Kafka(KafkaError::MessageConsumption(
            RDKafkaErrorCode::PartitionEOF
        ))
        .is_fatal());
    }
}
