// Kafka module - broker client contract, rdkafka implementation and rebalance handling
pub mod broker;
pub mod config;
pub mod consumer;
pub mod context;
pub mod offset_tracker;
pub mod rebalance_listener;

// Public API
pub use broker::{poll_or_cancel, LogConsumer, PollOutcome};
pub use config::ConsumerConfigBuilder;
pub use consumer::KafkaLogConsumer;
pub use rebalance_listener::{PartitionControl, RebalanceListener};
