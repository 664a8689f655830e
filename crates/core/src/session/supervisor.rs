use std::time::{Duration, Instant};

use serde::Serialize;

use super::{SessionError, SessionLauncher, SessionPhase};
use crate::decision::{CwndBounds, Decision};
use crate::exchange::{self, DecisionEnd, ExchangeError, SnapshotMode, StateSnapshot};
use crate::stats::{FaultCounters, FirstSample, Metrics, ObservationVector, WindowedStatistics};

/// Knobs of the decision-side session loop.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub snapshot_mode: SnapshotMode,
    /// Longest wait for a snapshot before an active session is stalled.
    pub state_timeout: Duration,
    pub windowed: bool,
    pub history_capacity: Option<usize>,
    pub first_sample: FirstSample,
    pub bounds: CwndBounds,
    /// `None` restarts a stalled session forever.
    pub max_restarts: Option<u32>,
    pub max_steps_per_episode: u64,
    pub max_total_steps: Option<u64>,
    /// Wall-clock budget of one episode, measured from the reset.
    pub max_episode_duration: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            snapshot_mode: SnapshotMode::Latest,
            state_timeout: Duration::from_secs(30),
            windowed: false,
            history_capacity: None,
            first_sample: FirstSample::ZeroSentinel,
            bounds: CwndBounds::default(),
            max_restarts: None,
            max_steps_per_episode: 500,
            max_total_steps: None,
            max_episode_duration: None,
        }
    }
}

/// Counters kept across stalls and episodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EpisodeCounters {
    pub total_steps: u64,
    pub num_resets: u64,
    pub restarts: u32,
    pub current_step: u64,
    /// `total_steps` when the current episode began.
    pub episode_start: u64,
    /// Reward accumulated by the trainer for the current episode.
    pub episode_return: f64,
}

/// Summary logged whenever an episode ends.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeReport {
    pub episode: u64,
    pub reason: &'static str,
    pub steps: u64,
    pub total_steps: u64,
    pub restarts: u32,
    pub episode_return: f64,
    pub faults: FaultCounters,
    pub adapter_stalls: u64,
    pub final_cwnd: f64,
}

/// What one decision cycle observed.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: ObservationVector,
    pub metrics: Metrics,
    pub phase: SessionPhase,
    pub finished: bool,
    /// A stall was detected and the session re-provisioned during this step.
    pub restarted: bool,
    pub snapshot_seq: u64,
}

/// Drives sessions from the decision side: provisions exchanges through a
/// [`SessionLauncher`], reads snapshots, forwards decisions and recovers from
/// stalls.
pub struct SessionSupervisor<L> {
    launcher: L,
    settings: SessionSettings,
    phase: SessionPhase,
    decision: Option<DecisionEnd>,
    window: WindowedStatistics,
    last: Option<StateSnapshot>,
    counters: EpisodeCounters,
    episode_started: Option<Instant>,
}

impl<L: SessionLauncher> SessionSupervisor<L> {
    pub fn new(launcher: L, settings: SessionSettings) -> Self {
        let window = WindowedStatistics::new(settings.history_capacity, settings.first_sample);
        Self {
            launcher,
            settings,
            phase: SessionPhase::Idle,
            decision: None,
            window,
            last: None,
            counters: EpisodeCounters::default(),
            episode_started: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn counters(&self) -> &EpisodeCounters {
        &self.counters
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Credit reward to the running episode.
    pub fn add_reward(&mut self, reward: f64) {
        self.counters.episode_return += reward;
    }

    /// Whether the global step budget is spent.
    pub fn budget_exhausted(&self) -> bool {
        self.settings
            .max_total_steps
            .is_some_and(|max| self.counters.total_steps >= max)
    }

    /// End the running episode, if any, and provision a fresh session.
    ///
    /// Returns the all-zero observation the decision process starts from.
    pub fn reset(&mut self) -> Result<ObservationVector, SessionError> {
        if matches!(
            self.phase,
            SessionPhase::Starting | SessionPhase::Active | SessionPhase::Stalled
        ) {
            self.finish("reset");
        }
        self.counters.num_resets += 1;
        self.counters.current_step = 0;
        self.counters.episode_start = self.counters.total_steps;
        self.counters.episode_return = 0.0;
        self.episode_started = Some(Instant::now());
        self.provision()?;
        tracing::info!(episode = self.counters.num_resets, "Session reset");
        Ok(ObservationVector::zeroed(self.settings.windowed))
    }

    /// Submit `decision` (if the session is active) and wait for the next
    /// snapshot.
    ///
    /// An idle supervisor is reset first. Decisions made before the first
    /// valid sample are dropped.
    ///
    /// If the adapter already timed out waiting for an answer, the session is
    /// restarted instead and `decision` is discarded.
    pub fn step(&mut self, decision: Option<Decision>) -> Result<StepOutcome, SessionError> {
        match self.phase {
            SessionPhase::Finished => return Err(SessionError::Finished),
            SessionPhase::Idle => {
                self.reset()?;
            }
            _ => {}
        }

        if self.adapter_stalled() {
            self.stall("action timeout")?;
            return Ok(self.outcome(true));
        }

        if let (SessionPhase::Active, Some(decision)) = (self.phase, decision) {
            let current = self
                .last
                .map(|s| s.stats.metrics.curr_window_size)
                .unwrap_or_default();
            let cwnd = decision.resolve(current, &self.settings.bounds);
            if let Err(ExchangeError::Disconnected) = self.submit(cwnd) {
                self.finish("stream lost");
                return Ok(self.outcome(false));
            }
        }

        let mut restarted = false;
        match self.read_states() {
            Ok(()) => {}
            Err(ExchangeError::Timeout) if self.phase == SessionPhase::Active => {
                self.stall("state timeout")?;
                restarted = true;
            }
            Err(ExchangeError::Timeout) if self.adapter_stalled() => {
                self.stall("action timeout")?;
                restarted = true;
            }
            Err(ExchangeError::Timeout) => {
                tracing::debug!(phase = %self.phase, "No telemetry yet");
            }
            Err(ExchangeError::Disconnected) => {
                self.finish("stream lost");
                return Ok(self.outcome(false));
            }
        }

        if self.phase == SessionPhase::Starting
            && self.last.is_some_and(|s| s.stats.metrics.has_valid_sample())
        {
            self.phase = SessionPhase::Active;
            tracing::info!(episode = self.counters.num_resets, "Session active");
        }

        if self.phase == SessionPhase::Active && !restarted {
            self.counters.current_step += 1;
            self.counters.total_steps += 1;
            if self.last.is_some_and(|s| s.stats.metrics.finished) {
                self.finish("transport finished");
            } else if self.counters.current_step >= self.settings.max_steps_per_episode {
                self.finish("step limit");
            } else if self.budget_exhausted() {
                self.finish("step budget");
            } else if self.episode_elapsed() {
                self.finish("time budget");
            }
        }
        Ok(self.outcome(restarted))
    }

    /// End the episode. Calling it again has no effect.
    pub fn finish(&mut self, reason: &'static str) {
        if matches!(self.phase, SessionPhase::Finished | SessionPhase::Idle) {
            return;
        }
        self.phase = SessionPhase::Finished;
        let adapter_stalls = self
            .decision
            .as_ref()
            .map(|d| d.health().stalls())
            .unwrap_or_default();
        self.teardown();

        let stats = self.last.map(|s| s.stats).unwrap_or_default();
        let report = EpisodeReport {
            episode: self.counters.num_resets,
            reason,
            steps: self.counters.current_step,
            total_steps: self.counters.total_steps,
            restarts: self.counters.restarts,
            episode_return: self.counters.episode_return,
            faults: stats.faults,
            adapter_stalls,
            final_cwnd: stats.metrics.curr_window_size,
        };
        match serde_json::to_string(&report) {
            Ok(json) => tracing::info!(report = %json, "Episode finished"),
            Err(error) => tracing::warn!(%error, "Failed to serialize episode report"),
        }
    }

    /// Tear down the current session for good.
    pub fn shutdown(&mut self) {
        self.finish("shutdown");
        self.teardown();
    }

    fn submit(&mut self, cwnd: i64) -> Result<(), ExchangeError> {
        match &self.decision {
            Some(end) => {
                tracing::trace!(cwnd, seq = end.last_seen(), "Submitting action");
                end.submit(cwnd)
            }
            None => Err(ExchangeError::Disconnected),
        }
    }

    /// Wait for one snapshot, then take whatever else is already queued.
    fn read_states(&mut self) -> Result<(), ExchangeError> {
        let Some(end) = self.decision.as_mut() else {
            return Err(ExchangeError::Disconnected);
        };
        let first = end.read_state(self.settings.state_timeout)?;
        let mut pending = vec![first];
        loop {
            match end.try_read_state() {
                Ok(Some(snapshot)) => pending.push(snapshot),
                Ok(None) | Err(ExchangeError::Timeout) => break,
                // the final snapshot is already in hand
                Err(ExchangeError::Disconnected) => break,
            }
        }
        for snapshot in pending {
            if self.settings.windowed {
                self.window.record(&snapshot.stats.metrics);
            }
            self.last = Some(snapshot);
        }
        Ok(())
    }

    /// The adapter gave up waiting for an answer on the current exchange.
    fn adapter_stalled(&self) -> bool {
        self.decision
            .as_ref()
            .is_some_and(|end| end.health().stalls() > 0)
    }

    fn episode_elapsed(&self) -> bool {
        match (self.settings.max_episode_duration, self.episode_started) {
            (Some(max), Some(started)) => started.elapsed() >= max,
            _ => false,
        }
    }

    fn stall(&mut self, cause: &'static str) -> Result<(), SessionError> {
        self.phase = SessionPhase::Stalled;
        self.counters.restarts += 1;
        let restarts = self.counters.restarts;
        tracing::warn!(restarts, cause, "Session stalled, restarting");
        if self.settings.max_restarts.is_some_and(|max| restarts > max) {
            self.finish("restart limit");
            return Err(SessionError::RestartLimit { restarts });
        }
        self.teardown();
        self.provision()
    }

    fn provision(&mut self) -> Result<(), SessionError> {
        let (adapter, decision) = exchange::channel(self.settings.snapshot_mode);
        self.launcher.launch(adapter)?;
        self.decision = Some(decision);
        self.window.reset();
        self.last = None;
        self.phase = SessionPhase::Starting;
        Ok(())
    }

    fn teardown(&mut self) {
        self.decision = None;
        self.launcher.teardown();
    }

    fn outcome(&self, restarted: bool) -> StepOutcome {
        let metrics = self.last.map(|s| s.stats.metrics).unwrap_or_default();
        let observation = match (&self.last, self.settings.windowed) {
            (None, windowed) => ObservationVector::zeroed(windowed),
            (Some(_), true) => ObservationVector::from_window(&self.window),
            (Some(s), false) => ObservationVector::from_metrics(&s.stats.metrics),
        };
        StepOutcome {
            observation,
            metrics,
            phase: self.phase,
            finished: self.phase == SessionPhase::Finished,
            restarted,
            snapshot_seq: self.last.map(|s| s.seq).unwrap_or_default(),
        }
    }
}

impl<L> Drop for SessionSupervisor<L> {
    fn drop(&mut self) {
        // disconnect the adapter side even if nobody called shutdown
        self.decision = None;
    }
}
