//! High-availability consumer.
//!
//! Several replicas read the same partitioned log. Only the leader applies the
//! leader topic to the processing engine; followers track the follower topic so a
//! new leader can resume where the cluster left off. The moving parts:
//!
//! - [`leadership`]: coalescing delivery of leadership signals to the poll task.
//! - [`coordinator`]: the leadership state machine that owns topic switching.
//! - [`kafka::rebalance_listener`]: restores checkpointed offsets on assignment.
//! - [`offset_store`]: durable `(topic, partition) -> next offset` checkpoints.
//! - [`poll_loop`]: poll, dispatch, commit, checkpoint, and the exit sequence.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`: full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`: full chain with `Caused by:` sections (Debug).
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod leadership;
pub mod metrics_consts;
pub mod offset_store;
pub mod poll_loop;
pub mod server;
pub mod service;
pub mod snapshot;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Re-export commonly used types for convenience
pub use coordinator::{ConsumptionCoordinator, SubscriptionMode, Transition};
pub use leadership::{leadership_channel, LeadershipNotifier, LeadershipWatcher};
pub use poll_loop::{ExitReason, LoopSummary, PollLoop};
pub use types::{ActiveTopic, CommitMode, LeadershipState, Partition, Record, RunDuration, RunState};
