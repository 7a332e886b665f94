//! The poll task.
//!
//! ```text
//! loop {
//!     cancelled / deadline passed?      ──► exit
//!     pending leadership transition?    ──► coordinator.on_leadership_change
//!     STOPPED?                          ──► wait for signal / cancel / deadline
//!     poll batch (interruptible)
//!     for record in batch:              (arrival order)
//!         RUNNING and owned?  ──► handler.handle(record, leadership)
//!         tracker[partition] = offset + 1
//!     commit (sync / async / broker auto-commit)
//!     persist tracked offsets
//! }
//! exit: final sync commit ─► persist ─► close
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::{ConsumptionCoordinator, Transition};
use crate::error::BrokerError;
use crate::handler::RecordHandler;
use crate::kafka::broker::{poll_or_cancel, LogConsumer, PollOutcome};
use crate::leadership::LeadershipWatcher;
use crate::metrics_consts::{
    POLL_BATCH_SIZE, POLL_ERRORS, RECORDS_DISPATCHED, RECORDS_FAILED, RECORDS_SKIPPED,
};
use crate::types::{CommitMode, LeadershipState, Record, RunDuration, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Cancelled,
    DurationElapsed,
    /// Never started and every leadership notifier is gone.
    NoLeadershipSource,
}

/// Counters for one `run`, returned when the loop exits cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub exit_reason: ExitReason,
    pub batches: u64,
    pub records_dispatched: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub topic_switches: u64,
}

#[derive(Debug, Default)]
struct LoopStats {
    batches: u64,
    records_dispatched: u64,
    records_skipped: u64,
    records_failed: u64,
}

pub struct PollLoop<C: LogConsumer> {
    coordinator: ConsumptionCoordinator<C>,
    handler: Arc<dyn RecordHandler>,
    leadership: LeadershipWatcher,
    cancel: CancellationToken,
    poll_timeout: Duration,
    signals_closed: bool,
}

impl<C: LogConsumer> PollLoop<C> {
    pub fn new(
        coordinator: ConsumptionCoordinator<C>,
        handler: Arc<dyn RecordHandler>,
        leadership: LeadershipWatcher,
        cancel: CancellationToken,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            handler,
            leadership,
            cancel,
            poll_timeout,
            signals_closed: false,
        }
    }

    pub fn coordinator(&self) -> &ConsumptionCoordinator<C> {
        &self.coordinator
    }

    /// Run until cancelled, until `duration` elapses, or until a fatal broker
    /// error. The exit sequence runs on every path, including the error path.
    pub async fn run(
        mut self,
        batch_size: usize,
        duration: RunDuration,
        commit_mode: CommitMode,
    ) -> Result<LoopSummary, BrokerError> {
        let deadline = duration.deadline_from(Instant::now());
        info!(
            consumer_id = self.coordinator.identity().id(),
            group_id = self.coordinator.identity().group_id(),
            batch_size,
            ?duration,
            commit_mode = commit_mode.as_str(),
            "Starting poll loop"
        );

        let mut stats = LoopStats::default();
        let result = self
            .run_until_exit(batch_size.max(1), deadline, commit_mode, &mut stats)
            .await;

        self.coordinator.shutdown();

        match result {
            Ok(exit_reason) => {
                info!(
                    ?exit_reason,
                    batches = stats.batches,
                    dispatched = stats.records_dispatched,
                    failed = stats.records_failed,
                    "Poll loop finished"
                );
                Ok(LoopSummary {
                    exit_reason,
                    batches: stats.batches,
                    records_dispatched: stats.records_dispatched,
                    records_skipped: stats.records_skipped,
                    records_failed: stats.records_failed,
                    topic_switches: self.coordinator.topic_switches(),
                })
            }
            Err(e) => {
                error!(error = ?e, "Poll loop stopped on fatal broker error");
                Err(e)
            }
        }
    }

    async fn run_until_exit(
        &mut self,
        batch_size: usize,
        deadline: Option<Instant>,
        commit_mode: CommitMode,
        stats: &mut LoopStats,
    ) -> Result<ExitReason, BrokerError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(ExitReason::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(ExitReason::DurationElapsed);
            }

            // Transitions are only ever applied here, between batches.
            if let Some(state) = self.leadership.take_pending() {
                self.apply_transition(state).await;
            }

            if self.coordinator.run_state() == RunState::Stopped {
                if let Some(reason) = self.wait_while_stopped(deadline).await {
                    return Ok(reason);
                }
                continue;
            }

            let timeout = match deadline {
                Some(d) => self
                    .poll_timeout
                    .min(d.saturating_duration_since(Instant::now())),
                None => self.poll_timeout,
            };

            let outcome = poll_or_cancel(
                self.coordinator.consumer_mut(),
                &self.cancel,
                batch_size,
                timeout,
            )
            .await;

            let records = match outcome {
                Ok(PollOutcome::Batch(records)) => records,
                Ok(PollOutcome::Cancelled) => return Ok(ExitReason::Cancelled),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Poll failed, retrying: {e:#}");
                    metrics::counter!(POLL_ERRORS, "level" => "warn").increment(1);
                    continue;
                }
            };

            // Rebalance callbacks run inside poll, so ownership is current now.
            self.coordinator.observe_assignment();

            if records.is_empty() {
                continue;
            }

            stats.batches += 1;
            metrics::histogram!(POLL_BATCH_SIZE).record(records.len() as f64);

            self.dispatch_batch(records, stats).await;

            self.coordinator.commit_tracked(commit_mode);
            self.coordinator.checkpoint();
        }
    }

    async fn dispatch_batch(&mut self, records: Vec<Record>, stats: &mut LoopStats) {
        let tracker = self.coordinator.listener().tracker().clone();

        for record in records {
            // Leadership cannot change mid-batch, so this is the state the record
            // is processed as.
            let Some(leadership) = self.coordinator.dispatch_state(&record.partition) else {
                debug!(
                    topic = record.topic(),
                    partition = record.partition_number(),
                    offset = record.offset,
                    run_state = self.coordinator.run_state().as_str(),
                    "Skipping record outside of running assignment"
                );
                stats.records_skipped += 1;
                metrics::counter!(RECORDS_SKIPPED).increment(1);
                continue;
            };

            match self.handler.handle(&record, leadership).await {
                Ok(()) => {
                    stats.records_dispatched += 1;
                    metrics::counter!(RECORDS_DISPATCHED, "leadership" => leadership.as_str())
                        .increment(1);
                }
                Err(e) => {
                    error!(
                        topic = record.topic(),
                        partition = record.partition_number(),
                        offset = record.offset,
                        leadership = leadership.as_str(),
                        "Record handler failed, skipping record: {e:#}"
                    );
                    stats.records_failed += 1;
                    metrics::counter!(RECORDS_FAILED).increment(1);
                }
            }

            tracker.mark_processed(&record.partition, record.next_offset());
        }
    }

    /// Apply one leadership transition. Draining the old subscription can wait on
    /// the broker for up to the drain timeout, so cancellation abandons it; the
    /// exit sequence still commits, persists and closes afterwards.
    async fn apply_transition(&mut self, state: LeadershipState) {
        let result = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                info!(state = %state, "Shutdown requested, abandoning leadership transition");
                return;
            }

            result = self.coordinator.on_leadership_change(state) => result,
        };

        match result {
            Ok(Transition::Unchanged) => {}
            Ok(transition) => debug!(?transition, "Leadership transition applied"),
            Err(e) => warn!(
                state = %state,
                "Could not open subscription, will retry: {e:#}"
            ),
        }
    }

    /// Nothing is subscribed. Wait for a leadership signal, or retry the last one
    /// if opening its topic failed.
    async fn wait_while_stopped(&mut self, deadline: Option<Instant>) -> Option<ExitReason> {
        let retry = self.coordinator.leadership();
        if retry.is_none() && self.signals_closed {
            info!("No leadership source left and never started");
            return Some(ExitReason::NoLeadershipSource);
        }

        let listen = !self.signals_closed;
        let backoff = self.poll_timeout;

        let next = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => return Some(ExitReason::Cancelled),

            _ = sleep_until_deadline(deadline) => return Some(ExitReason::DurationElapsed),

            next = self.leadership.next_transition(), if listen => match next {
                Some(state) => state,
                None => {
                    self.signals_closed = true;
                    return None;
                }
            },

            _ = sleep(backoff), if retry.is_some() => match retry {
                Some(state) => state,
                None => return None,
            },
        };

        self.apply_transition(next).await;
        None
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
