//! Leadership signal delivery.
//!
//! The election mechanism calls [`LeadershipNotifier::on_leadership_change`] from
//! whatever thread it runs on. The call only records the latest state and returns.
//! The poll task observes it between batches through [`LeadershipWatcher`]. At most
//! one transition is ever pending: a newer signal replaces an unobserved older one,
//! so rapid flapping collapses into its final state.

use tokio::sync::watch;
use tracing::debug;

use crate::types::LeadershipState;

pub fn leadership_channel() -> (LeadershipNotifier, LeadershipWatcher) {
    let (tx, rx) = watch::channel(None);
    (LeadershipNotifier { tx }, LeadershipWatcher { rx })
}

#[derive(Clone, Debug)]
pub struct LeadershipNotifier {
    tx: watch::Sender<Option<LeadershipState>>,
}

impl LeadershipNotifier {
    pub fn on_leadership_change(&self, state: LeadershipState) {
        debug!(state = %state, "Leadership signal received");
        self.tx.send_replace(Some(state));
    }
}

#[derive(Debug)]
pub struct LeadershipWatcher {
    rx: watch::Receiver<Option<LeadershipState>>,
}

impl LeadershipWatcher {
    /// Take the pending transition, if a signal arrived since the last call.
    pub fn take_pending(&mut self) -> Option<LeadershipState> {
        let changed = self.rx.borrow().has_changed();
        if changed {
            *self.rx.borrow_and_update()
        } else {
            None
        }
    }

    /// Wait for the next signal. Returns `None` once every notifier is gone and
    /// nothing is pending.
    pub async fn next_transition(&mut self) -> Option<LeadershipState> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(state) = *self.rx.borrow_and_update() {
                return Some(state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_pending_initially() {
        let (_notifier, mut watcher) = leadership_channel();
        assert_eq!(watcher.take_pending(), None);
    }

    #[test]
    fn test_latest_signal_wins() {
        let (notifier, mut watcher) = leadership_channel();

        notifier.on_leadership_change(LeadershipState::Leader);
        notifier.on_leadership_change(LeadershipState::NotLeader);
        notifier.on_leadership_change(LeadershipState::Leader);

        assert_eq!(watcher.take_pending(), Some(LeadershipState::Leader));
        assert_eq!(watcher.take_pending(), None);
    }

    #[test]
    fn test_notifier_usable_from_other_threads() {
        let (notifier, mut watcher) = leadership_channel();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let notifier = notifier.clone();
                std::thread::spawn(move || notifier.on_leadership_change(LeadershipState::NotLeader))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(watcher.take_pending(), Some(LeadershipState::NotLeader));
    }

    #[test]
    fn test_pending_signal_survives_dropped_notifier() {
        let (notifier, mut watcher) = leadership_channel();
        notifier.on_leadership_change(LeadershipState::Leader);
        drop(notifier);

        assert_eq!(watcher.take_pending(), Some(LeadershipState::Leader));
    }

    #[tokio::test]
    async fn test_next_transition_wakes_on_signal() {
        let (notifier, mut watcher) = leadership_channel();

        let waiter = tokio::spawn(async move { watcher.next_transition().await });
        notifier.on_leadership_change(LeadershipState::Leader);

        assert_eq!(waiter.await.unwrap(), Some(LeadershipState::Leader));
    }

    #[tokio::test]
    async fn test_next_transition_ends_when_closed() {
        let (notifier, mut watcher) = leadership_channel();
        drop(notifier);
        assert_eq!(watcher.next_transition().await, None);
    }
}
