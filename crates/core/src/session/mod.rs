//! Session lifecycle.
//!
//! A session is the lifetime of one telemetry stream bound to one transport
//! connection:
//!
//! ```text
//! IDLE -> STARTING -> ACTIVE -> FINISHED
//!            ^          |
//!            +- STALLED <+
//! ```
//!
//! The [`SessionSupervisor`] runs on the decision side and owns the
//! [`DecisionEnd`](crate::exchange::DecisionEnd) of the current exchange.
//! The [`AdapterEnd`] is handed to a [`SessionLauncher`], which in a server
//! parks it in a [`SessionBinding`] until the next inbound stream claims it.

use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::exchange::{AdapterEnd, ExchangeError};

mod supervisor;

pub use supervisor::{EpisodeCounters, EpisodeReport, SessionSettings, SessionSupervisor, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Idle,
    Starting,
    Active,
    Stalled,
    Finished,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "IDLE",
            SessionPhase::Starting => "STARTING",
            SessionPhase::Active => "ACTIVE",
            SessionPhase::Stalled => "STALLED",
            SessionPhase::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to launch session: {0}")]
    Launch(String),
    #[error("giving up after {restarts} restarts")]
    RestartLimit { restarts: u32 },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("session already finished")]
    Finished,
}

/// Provisions whatever produces telemetry for a fresh exchange.
pub trait SessionLauncher: Send {
    /// Connect `end` to a telemetry source.
    fn launch(&mut self, end: AdapterEnd) -> Result<(), SessionError>;

    /// Release everything acquired by the last `launch`.
    fn teardown(&mut self);
}

/// Rendezvous between the supervisor thread and inbound RPC streams.
///
/// Holds at most one unclaimed [`AdapterEnd`]. Binding a new end replaces an
/// unclaimed one, whose conduits then disconnect.
#[derive(Default)]
pub struct SessionBinding {
    slot: Mutex<Option<AdapterEnd>>,
    notify: Notify,
    generation: AtomicU64,
}

impl SessionBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `end` for the next stream. Returns the binding generation.
    pub fn bind(&self, end: AdapterEnd) -> u64 {
        let replaced = self.slot.lock().replace(end).is_some();
        if replaced {
            tracing::debug!("Replacing unclaimed session binding");
        }
        self.notify.notify_one();
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop an unclaimed end. Returns whether there was one.
    pub fn unbind(&self) -> bool {
        self.slot.lock().take().is_some()
    }

    pub fn is_bound(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Claim the parked end, waiting up to `timeout` for one to be bound.
    pub async fn acquire(&self, timeout: Duration) -> Option<AdapterEnd> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(end) = self.slot.lock().take() {
                return Some(end);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.slot.lock().take();
            }
        }
    }
}

/// Launcher for a server: each session waits for the transport to open a
/// stream against the shared binding.
pub struct BindingLauncher {
    binding: Arc<SessionBinding>,
}

impl BindingLauncher {
    pub fn new(binding: Arc<SessionBinding>) -> Self {
        Self { binding }
    }
}

impl SessionLauncher for BindingLauncher {
    fn launch(&mut self, end: AdapterEnd) -> Result<(), SessionError> {
        let generation = self.binding.bind(end);
        tracing::info!(generation, "Session bound, waiting for telemetry stream");
        Ok(())
    }

    fn teardown(&mut self) {
        if self.binding.unbind() {
            tracing::debug!("Released unclaimed session binding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{channel, SnapshotMode};

    #[test_log::test(tokio::test)]
    async fn acquire_waits_for_bind() {
        let binding = Arc::new(SessionBinding::new());
        let waiter = {
            let binding = binding.clone();
            tokio::spawn(async move { binding.acquire(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        let (adapter, _decision) = channel(SnapshotMode::Latest);
        assert_eq!(binding.bind(adapter), 1);
        assert!(waiter.await.unwrap().is_some());
        assert!(!binding.is_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_without_session() {
        let binding = SessionBinding::new();
        assert!(binding.acquire(Duration::from_secs(30)).await.is_none());
    }

    #[test]
    fn rebinding_disconnects_unclaimed_end() {
        let binding = SessionBinding::new();
        let (first, mut first_decision) = channel(SnapshotMode::Latest);
        let (second, _second_decision) = channel(SnapshotMode::Latest);
        binding.bind(first);
        binding.bind(second);
        assert_eq!(binding.generation(), 2);
        assert_eq!(
            first_decision.read_state(Duration::from_millis(10)),
            Err(ExchangeError::Disconnected)
        );

        let mut launcher = BindingLauncher::new(Arc::new(binding));
        launcher.teardown();
        assert!(!launcher.binding.is_bound());
    }
}
