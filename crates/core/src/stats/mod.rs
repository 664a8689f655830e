//! Statistics engine.
//!
//! Turns the irregular stream of raw telemetry observations reported by the
//! transport into smoothed, windowed and differenced metrics.
//!
//! ## Ownership
//!
//! A [`SessionState`] belongs to exactly one receive task for the lifetime of
//! one transport session. It is never shared: readers get a copy through
//! [`SessionState::snapshot`], so the update path needs no locking.
//!
//! ## First-sample detection
//!
//! Smoothed metrics (SRTT, the EMAs, MIN_RTT) seed themselves from their
//! first sample. By default a metric whose current value is exactly `0.0` is
//! considered uninitialised ([`FirstSample::ZeroSentinel`]). This misreads a
//! genuine zero reading as "no sample yet", but deployed policies were trained
//! against that behaviour so it stays the default. [`FirstSample::Explicit`]
//! tracks a per-metric flag instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parameters::Parameter;

mod engine;
pub mod estimators;
mod window;

pub use engine::{FaultCounters, Metrics, SessionState, StatsSnapshot, TickOutcome};
pub use window::{ObservationVector, StatisticSummary, WindowedStatistics};

/// One inbound telemetry event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawObservation {
    pub parameter: Parameter,
    pub value: f64,
    /// Transport clock, unit fixed per deployment.
    pub timestamp: i64,
}

impl RawObservation {
    pub fn new(parameter: Parameter, value: f64, timestamp: i64) -> Self {
        Self {
            parameter,
            value,
            timestamp,
        }
    }
}

/// A full-vector telemetry tick: every raw value the transport tracks at
/// one instant. Counters are cumulative since the start of the connection,
/// except `retransmissions`, which covers the interval since the last tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryTick {
    pub timestamp: i64,
    pub curr_window_size: f64,
    pub cumulative_sent_bytes: f64,
    pub cumulative_rcv_bytes: f64,
    pub cumulative_sent_good_bytes: f64,
    pub retransmissions: f64,
    pub cumulative_packet_loss: f64,
    pub last_rtt: f64,
    pub finished: bool,
}

/// How smoothed metrics detect their first sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FirstSample {
    /// A value of exactly `0.0` means "not yet initialised".
    #[default]
    ZeroSentinel,
    /// Each metric carries its own initialisation flag.
    Explicit,
}

/// Per-sample faults. None of these end a session; the offending field is
/// skipped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("unknown parameter id {0}")]
    UnknownParameter(u32),

    #[error("{parameter} is derived and cannot be reported by telemetry")]
    DerivedParameter { parameter: Parameter },

    #[error("{parameter} sample at {timestamp} precedes last update at {last}")]
    OrderingViolation {
        parameter: Parameter,
        timestamp: i64,
        last: i64,
    },

    #[error("non-finite value for {parameter}")]
    NonFiniteValue { parameter: Parameter },

    #[error("{parameter} counter went backwards: {value} < {total}")]
    CounterRegression {
        parameter: Parameter,
        value: f64,
        total: f64,
    },

    #[error("session already finished, ignoring {parameter}")]
    SessionFinished { parameter: Parameter },

    #[error("{parameter} sample at {timestamp} is too far from last update at {last}")]
    TimestampOverflow {
        parameter: Parameter,
        timestamp: i64,
        last: i64,
    },
}
