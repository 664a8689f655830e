//! State/action hand-off between the stream adapter and the decision process.
//!
//! Two one-way conduits per session:
//!
//! ```text
//!   stream adapter                          decision process
//!  +---------------+   StateSnapshot    +-----------------+
//!  | StatePublisher| -----------------> |   DecisionEnd   |
//!  | ActionReceiver| <----------------- |                 |
//!  +---------------+      Action        +-----------------+
//! ```
//!
//! Snapshots flow through a latest-wins slot by default, or an unbounded
//! queue when every intermediate state matters. Actions flow through a
//! single slot and carry the sequence number of the snapshot they answer;
//! the adapter never forwards an action older than one already delivered.
//!
//! Dropping either end disconnects both conduits, which is how the
//! counterpart task learns it should exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stats::StatsSnapshot;

pub mod conduit;

use conduit::{conduit, ConduitReceiver, ConduitSender, Flavor};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("timed out waiting on the exchange")]
    Timeout,
    #[error("exchange counterpart disconnected")]
    Disconnected,
}

/// How derived-state snapshots are buffered for the decision process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotMode {
    /// Single slot, the newest snapshot replaces an unread one.
    #[default]
    Latest,
    /// Every snapshot is kept until read.
    Queue,
}

impl From<SnapshotMode> for Flavor {
    fn from(mode: SnapshotMode) -> Self {
        match mode {
            SnapshotMode::Latest => Flavor::Overwrite,
            SnapshotMode::Queue => Flavor::Queue,
        }
    }
}

/// A statistics snapshot tagged with its position in the session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateSnapshot {
    /// Starts at 1 for the first snapshot of a session.
    pub seq: u64,
    pub stats: StatsSnapshot,
}

/// Next congestion window, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub cwnd: i64,
    /// Sequence number of the snapshot this action answers.
    pub snapshot_seq: u64,
}

/// Liveness counters shared by both ends of one exchange.
#[derive(Debug, Default)]
pub struct ExchangeHealth {
    published: AtomicU64,
    overwritten: AtomicU64,
    delivered: AtomicU64,
    stale_actions: AtomicU64,
    stalls: AtomicU64,
}

impl ExchangeHealth {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Snapshots replaced before the decision process read them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn stale_actions(&self) -> u64 {
        self.stale_actions.load(Ordering::Relaxed)
    }

    /// Action reads on the adapter side that hit the timeout.
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }
}

/// Create the conduits for one session.
pub fn channel(mode: SnapshotMode) -> (AdapterEnd, DecisionEnd) {
    let (state_tx, state_rx) = conduit(mode.into());
    let (action_tx, action_rx) = conduit(Flavor::Overwrite);
    let health = Arc::new(ExchangeHealth::default());
    (
        AdapterEnd {
            publisher: StatePublisher {
                states: state_tx,
                seq: 0,
                health: health.clone(),
            },
            actions: ActionReceiver {
                actions: action_rx,
                last_delivered: 0,
                stalled_at: None,
                health: health.clone(),
            },
        },
        DecisionEnd {
            states: state_rx,
            actions: action_tx,
            last_seen: 0,
            health,
        },
    )
}

/// The stream adapter's side of an exchange. Split it to hand each half to
/// its own task.
pub struct AdapterEnd {
    publisher: StatePublisher,
    actions: ActionReceiver,
}

impl AdapterEnd {
    pub fn split(self) -> (StatePublisher, ActionReceiver) {
        (self.publisher, self.actions)
    }

    pub fn health(&self) -> &Arc<ExchangeHealth> {
        &self.publisher.health
    }
}

pub struct StatePublisher {
    states: ConduitSender<StateSnapshot>,
    seq: u64,
    health: Arc<ExchangeHealth>,
}

impl StatePublisher {
    /// Hand a snapshot to the decision process. Never blocks.
    pub fn publish(&mut self, stats: StatsSnapshot) -> Result<u64, ExchangeError> {
        self.seq += 1;
        let replaced = self.states.send(StateSnapshot {
            seq: self.seq,
            stats,
        })?;
        self.health.published.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.health.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        Ok(self.seq)
    }

    /// Sequence number of the last published snapshot.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_closed(&self) -> bool {
        self.states.is_closed()
    }
}

pub struct ActionReceiver {
    actions: ConduitReceiver<Action>,
    last_delivered: u64,
    /// Snapshot whose missing answer was already counted as a stall.
    stalled_at: Option<u64>,
    health: Arc<ExchangeHealth>,
}

impl ActionReceiver {
    /// Wait up to `timeout` for the next action that is not older than the
    /// last one returned.
    ///
    /// A timeout while a published snapshot is still unanswered counts as
    /// one stall; further timeouts on the same snapshot do not.
    pub async fn next(&mut self, timeout: Duration) -> Result<Action, ExchangeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let action = match self.actions.recv_timeout_async(remaining).await {
                Ok(action) => action,
                Err(ExchangeError::Timeout) => {
                    self.note_timeout(timeout);
                    return Err(ExchangeError::Timeout);
                }
                Err(err) => return Err(err),
            };
            if action.snapshot_seq < self.last_delivered {
                self.health.stale_actions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    snapshot_seq = action.snapshot_seq,
                    last_delivered = self.last_delivered,
                    "dropping stale action"
                );
                continue;
            }
            self.last_delivered = action.snapshot_seq;
            self.health.delivered.fetch_add(1, Ordering::Relaxed);
            return Ok(action);
        }
    }

    fn note_timeout(&mut self, timeout: Duration) {
        let pending = self.health.published();
        if pending > self.last_delivered && self.stalled_at != Some(pending) {
            self.stalled_at = Some(pending);
            self.health.record_stall();
            tracing::warn!(
                seq = pending,
                timeout = ?timeout,
                "Decision process did not answer in time"
            );
        }
    }

    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }

    pub fn health(&self) -> &Arc<ExchangeHealth> {
        &self.health
    }
}

/// The decision process's side of an exchange. Used from a plain thread.
pub struct DecisionEnd {
    states: ConduitReceiver<StateSnapshot>,
    actions: ConduitSender<Action>,
    last_seen: u64,
    health: Arc<ExchangeHealth>,
}

impl DecisionEnd {
    /// Block for at most `timeout` waiting for the next snapshot.
    pub fn read_state(&mut self, timeout: Duration) -> Result<StateSnapshot, ExchangeError> {
        let snapshot = self.states.recv_timeout(timeout)?;
        self.last_seen = snapshot.seq;
        Ok(snapshot)
    }

    pub fn try_read_state(&mut self) -> Result<Option<StateSnapshot>, ExchangeError> {
        let snapshot = self.states.try_recv()?;
        if let Some(s) = &snapshot {
            self.last_seen = s.seq;
        }
        Ok(snapshot)
    }

    /// Submit a window answering the most recently read snapshot.
    pub fn submit(&self, cwnd: i64) -> Result<(), ExchangeError> {
        self.actions.send(Action {
            cwnd,
            snapshot_seq: self.last_seen,
        })?;
        Ok(())
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn health(&self) -> &Arc<ExchangeHealth> {
        &self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Metrics, StatsSnapshot};

    fn stats(cwnd: f64) -> StatsSnapshot {
        StatsSnapshot {
            metrics: Metrics {
                curr_window_size: cwnd,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn latest_mode_delivers_newest_snapshot() {
        let (adapter, mut decision) = channel(SnapshotMode::Latest);
        let (mut publisher, _actions) = adapter.split();
        for cwnd in [1000.0, 2000.0, 3000.0] {
            publisher.publish(stats(cwnd)).unwrap();
        }
        let snapshot = decision.read_state(Duration::from_millis(50)).unwrap();
        assert_eq!(snapshot.seq, 3);
        assert_eq!(snapshot.stats.metrics.curr_window_size, 3000.0);
        assert_eq!(decision.health().overwritten(), 2);
        assert_eq!(decision.try_read_state().unwrap(), None);
    }

    #[test_log::test(tokio::test)]
    async fn queue_mode_keeps_history() {
        let (adapter, mut decision) = channel(SnapshotMode::Queue);
        let (mut publisher, _actions) = adapter.split();
        for cwnd in [1000.0, 2000.0] {
            publisher.publish(stats(cwnd)).unwrap();
        }
        assert_eq!(decision.read_state(Duration::from_millis(50)).unwrap().seq, 1);
        assert_eq!(decision.read_state(Duration::from_millis(50)).unwrap().seq, 2);
    }

    #[test_log::test(tokio::test)]
    async fn action_answers_last_read_snapshot() {
        let (adapter, mut decision) = channel(SnapshotMode::Latest);
        let (mut publisher, mut actions) = adapter.split();
        publisher.publish(stats(1000.0)).unwrap();
        decision.read_state(Duration::from_millis(50)).unwrap();
        decision.submit(2000).unwrap();

        let action = actions.next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            action,
            Action {
                cwnd: 2000,
                snapshot_seq: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_actions_are_never_delivered() {
        let (adapter, decision) = channel(SnapshotMode::Latest);
        let (_publisher, mut actions) = adapter.split();
        actions.last_delivered = 5;

        // answers snapshot 0, older than what the adapter already sent
        decision.submit(1234).unwrap();
        assert_eq!(
            actions.next(Duration::from_secs(1)).await,
            Err(ExchangeError::Timeout)
        );
        assert_eq!(actions.health().stale_actions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_snapshot_counts_one_stall() {
        let (adapter, mut decision) = channel(SnapshotMode::Latest);
        let (mut publisher, mut actions) = adapter.split();

        // nothing published yet, waiting is not a stall
        assert_eq!(
            actions.next(Duration::from_millis(100)).await,
            Err(ExchangeError::Timeout)
        );
        assert_eq!(actions.health().stalls(), 0);

        publisher.publish(stats(1000.0)).unwrap();
        for _ in 0..3 {
            assert_eq!(
                actions.next(Duration::from_millis(100)).await,
                Err(ExchangeError::Timeout)
            );
        }
        assert_eq!(actions.health().stalls(), 1);

        decision.read_state(Duration::from_millis(10)).unwrap();
        decision.submit(2000).unwrap();
        assert_eq!(actions.next(Duration::from_millis(100)).await.unwrap().cwnd, 2000);

        publisher.publish(stats(2000.0)).unwrap();
        assert_eq!(
            actions.next(Duration::from_millis(100)).await,
            Err(ExchangeError::Timeout)
        );
        assert_eq!(actions.health().stalls(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn dropping_decision_end_disconnects_adapter() {
        let (adapter, decision) = channel(SnapshotMode::Latest);
        let (mut publisher, mut actions) = adapter.split();
        drop(decision);
        assert_eq!(publisher.publish(stats(1.0)), Err(ExchangeError::Disconnected));
        assert_eq!(
            actions.next(Duration::from_secs(1)).await,
            Err(ExchangeError::Disconnected)
        );
    }

    #[test]
    fn dropping_adapter_end_disconnects_decision() {
        let (adapter, mut decision) = channel(SnapshotMode::Latest);
        drop(adapter);
        assert_eq!(
            decision.read_state(Duration::from_millis(10)),
            Err(ExchangeError::Disconnected)
        );
        assert_eq!(decision.submit(1), Err(ExchangeError::Disconnected));
    }
}
