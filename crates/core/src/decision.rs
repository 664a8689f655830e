//! Decision process contract.
//!
//! Window-adjustment policies are supplied from outside; this module only
//! defines how a policy plugs into a [`SessionSupervisor`] and how its
//! output becomes a congestion window.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::session::{EpisodeCounters, SessionError, SessionLauncher, SessionPhase, SessionSupervisor};
use crate::stats::{Metrics, ObservationVector};

/// Relative window changes of the discrete action space, by index.
pub const ACTIONS: [f64; 6] = [1.0, 0.33, 0.05, -0.05, -0.33, 0.0];

/// Smallest window the transport accepts, one full packet.
pub const MIN_CWND_BYTES: i64 = 1444;
pub const MAX_CWND_BYTES: i64 = 25_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CwndBounds {
    pub min: i64,
    pub max: i64,
}

impl Default for CwndBounds {
    fn default() -> Self {
        Self {
            min: MIN_CWND_BYTES,
            max: MAX_CWND_BYTES,
        }
    }
}

impl CwndBounds {
    /// Clamp a target window into `[min, max]`. Non-finite targets map to
    /// `min`.
    pub fn clamp(&self, target: f64) -> i64 {
        if !target.is_finite() {
            return self.min;
        }
        (target.ceil() as i64).max(self.min).min(self.max)
    }
}

/// What a policy wants done with the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Keep the current window.
    Hold,
    /// Absolute window in bytes.
    Window(i64),
    /// Relative change, `0.33` grows the window by a third.
    Percentage(f64),
}

impl Decision {
    /// Entry of the discrete action table.
    pub fn from_table(index: usize) -> Option<Self> {
        ACTIONS.get(index).map(|pct| Decision::Percentage(*pct))
    }

    /// Window to send given the transport's current one.
    pub fn resolve(self, current: f64, bounds: &CwndBounds) -> i64 {
        let target = match self {
            Decision::Hold => current,
            Decision::Window(bytes) => bytes as f64,
            Decision::Percentage(pct) => (current + pct * current).ceil(),
        };
        bounds.clamp(target)
    }
}

pub trait DecisionPolicy: Send {
    fn name(&self) -> &str;

    /// Called once per cycle with the latest observation of an active session.
    fn decide(&mut self, observation: &ObservationVector, metrics: &Metrics) -> Decision;

    /// Called when a new episode starts.
    fn reset(&mut self) {}
}

/// Always makes the same decision.
#[derive(Debug, Clone)]
pub struct FixedPolicy {
    name: String,
    decision: Decision,
}

impl FixedPolicy {
    pub fn new(decision: Decision) -> Self {
        let name = match decision {
            Decision::Hold => "hold".to_owned(),
            Decision::Window(bytes) => format!("fixed:{bytes}"),
            Decision::Percentage(pct) => format!("percentage:{pct}"),
        };
        Self { name, decision }
    }
}

impl DecisionPolicy for FixedPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(&mut self, _observation: &ObservationVector, _metrics: &Metrics) -> Decision {
        self.decision
    }
}

/// Policy selected from configuration: `hold`, `fixed:<bytes>` or
/// `table:<index>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PolicySpec {
    #[default]
    Hold,
    Fixed(i64),
    Table(usize),
}

impl PolicySpec {
    pub fn build(&self) -> Box<dyn DecisionPolicy> {
        let decision = match *self {
            PolicySpec::Hold => Decision::Hold,
            PolicySpec::Fixed(bytes) => Decision::Window(bytes),
            PolicySpec::Table(index) => Decision::from_table(index).unwrap_or(Decision::Hold),
        };
        Box::new(FixedPolicy::new(decision))
    }
}

impl FromStr for PolicySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (s, None),
        };
        match (kind, arg) {
            ("hold", None) => Ok(PolicySpec::Hold),
            ("fixed", Some(bytes)) => bytes
                .parse()
                .map(PolicySpec::Fixed)
                .map_err(|e| format!("invalid window `{bytes}`: {e}")),
            ("table", Some(index)) => {
                let index: usize = index
                    .parse()
                    .map_err(|e| format!("invalid action index `{index}`: {e}"))?;
                if index >= ACTIONS.len() {
                    return Err(format!(
                        "action index {index} out of range, table has {} entries",
                        ACTIONS.len()
                    ));
                }
                Ok(PolicySpec::Table(index))
            }
            _ => Err(format!(
                "unknown policy `{s}`, expected hold, fixed:<bytes> or table:<index>"
            )),
        }
    }
}

impl TryFrom<String> for PolicySpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PolicySpec> for String {
    fn from(spec: PolicySpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for PolicySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicySpec::Hold => write!(f, "hold"),
            PolicySpec::Fixed(bytes) => write!(f, "fixed:{bytes}"),
            PolicySpec::Table(index) => write!(f, "table:{index}"),
        }
    }
}

/// Runs a policy against a supervisor on a dedicated thread until stopped,
/// the step budget is spent, or the session fails.
pub struct PolicyRunner {
    stop: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
    handle: JoinHandle<Result<EpisodeCounters, SessionError>>,
}

impl PolicyRunner {
    pub fn spawn<L>(
        supervisor: SessionSupervisor<L>,
        policy: Box<dyn DecisionPolicy>,
    ) -> std::io::Result<Self>
    where
        L: SessionLauncher + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = watch::channel(false);
        let handle = std::thread::Builder::new()
            .name("marlin-policy".into())
            .spawn({
                let stop = stop.clone();
                move || {
                    let result = run_policy(supervisor, policy, &stop);
                    let _ = done_tx.send(true);
                    result
                }
            })?;
        Ok(Self { stop, done, handle })
    }

    /// Resolves once the loop has exited, for whatever reason.
    pub async fn stopped(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Ask the loop to exit after the current step.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(self) -> Result<EpisodeCounters, SessionError> {
        self.handle
            .join()
            .map_err(|_| SessionError::Launch("policy thread panicked".into()))?
    }
}

fn run_policy<L: SessionLauncher>(
    mut supervisor: SessionSupervisor<L>,
    mut policy: Box<dyn DecisionPolicy>,
    stop: &AtomicBool,
) -> Result<EpisodeCounters, SessionError> {
    tracing::info!(policy = policy.name(), "Starting decision loop");
    supervisor.reset()?;
    policy.reset();
    let mut decision = None;
    let result = loop {
        if stop.load(Ordering::Acquire) {
            break Ok(());
        }
        let outcome = match supervisor.step(decision.take()) {
            Ok(outcome) => outcome,
            Err(error) => break Err(error),
        };
        if outcome.finished {
            if supervisor.budget_exhausted() {
                tracing::info!("Step budget exhausted, stopping decision loop");
                break Ok(());
            }
            if let Err(error) = supervisor.reset() {
                break Err(error);
            }
            policy.reset();
            continue;
        }
        if outcome.phase == SessionPhase::Active {
            decision = Some(policy.decide(&outcome.observation, &outcome.metrics));
        }
    };
    supervisor.shutdown();
    let counters = *supervisor.counters();
    tracing::info!(
        total_steps = counters.total_steps,
        episodes = counters.num_resets,
        restarts = counters.restarts,
        "Decision loop stopped"
    );
    result.map(|()| counters)
}
