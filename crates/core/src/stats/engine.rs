use serde::Serialize;

use super::estimators::{
    self, exponential_moving_average, min_excluding_zero, smoothed_rtt, writable_bytes, ALPHA,
};
use super::{FirstSample, RawObservation, TelemetryError, TelemetryTick};
use crate::parameters::Parameter;

/// Current value of every registered metric.
///
/// Counters (`sent_bytes`, `sent_good_bytes`, `rcv_bytes`,
/// `cumulative_retransmissions`, `packet_loss`) are totals since session
/// start. `*_timeframe`, `throughput`, `goodput` and `retransmissions` cover
/// the interval since the previous update of the same counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub curr_window_size: f64,
    pub sent_bytes: f64,
    pub rcv_bytes: f64,
    pub sent_good_bytes: f64,
    pub sent_bytes_timeframe: f64,
    pub sent_good_bytes_timeframe: f64,
    pub unack_bytes: f64,
    pub cumulative_retransmissions: f64,
    pub retransmissions: f64,
    pub ema_retransmissions: f64,
    pub writable_bytes: f64,
    pub last_rtt: f64,
    pub min_rtt: f64,
    pub max_rtt: f64,
    pub srtt: f64,
    pub var_rtt: f64,
    pub timestamp: f64,
    pub finished: bool,
    pub chunk_rtt: f64,
    pub packet_loss: f64,
    pub throughput: f64,
    pub goodput: f64,
    pub ema_throughput: f64,
    pub ema_goodput: f64,
}

impl Metrics {
    pub fn get(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::CurrWindowSize => self.curr_window_size,
            Parameter::SentBytes => self.sent_bytes,
            Parameter::RcvBytes => self.rcv_bytes,
            Parameter::SentGoodBytes => self.sent_good_bytes,
            Parameter::SentBytesTimeframe => self.sent_bytes_timeframe,
            Parameter::SentGoodBytesTimeframe => self.sent_good_bytes_timeframe,
            Parameter::UnackBytes => self.unack_bytes,
            Parameter::CumulativeRetransmissions => self.cumulative_retransmissions,
            Parameter::Retransmissions => self.retransmissions,
            Parameter::EmaRetransmissions => self.ema_retransmissions,
            Parameter::WritableBytes => self.writable_bytes,
            Parameter::LastRtt => self.last_rtt,
            Parameter::MinRtt => self.min_rtt,
            Parameter::MaxRtt => self.max_rtt,
            Parameter::Srtt => self.srtt,
            Parameter::VarRtt => self.var_rtt,
            Parameter::Timestamp => self.timestamp,
            Parameter::Finished => {
                if self.finished {
                    1.0
                } else {
                    0.0
                }
            }
            Parameter::ChunkRtt => self.chunk_rtt,
            Parameter::PacketLoss => self.packet_loss,
            Parameter::Throughput => self.throughput,
            Parameter::Goodput => self.goodput,
            Parameter::EmaThroughput => self.ema_throughput,
            Parameter::EmaGoodput => self.ema_goodput,
        }
    }

    /// `true` once the transport has reported something worth acting on.
    pub fn has_valid_sample(&self) -> bool {
        self.sent_bytes > 0.0 || self.curr_window_size > 0.0
    }
}

/// Per-session count of skipped or corrected samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultCounters {
    pub ordering_violations: u64,
    pub unknown_parameters: u64,
    pub derived_writes: u64,
    pub non_finite_values: u64,
    pub counter_regressions: u64,
    pub negative_writable: u64,
    pub after_finish: u64,
    pub malformed_timestamps: u64,
}

impl FaultCounters {
    fn record(&mut self, error: &TelemetryError) {
        match error {
            TelemetryError::UnknownParameter(_) => self.unknown_parameters += 1,
            TelemetryError::DerivedParameter { .. } => self.derived_writes += 1,
            TelemetryError::OrderingViolation { .. } => self.ordering_violations += 1,
            TelemetryError::NonFiniteValue { .. } => self.non_finite_values += 1,
            TelemetryError::CounterRegression { .. } => self.counter_regressions += 1,
            TelemetryError::SessionFinished { .. } => self.after_finish += 1,
            TelemetryError::TimestampOverflow { .. } => self.malformed_timestamps += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.ordering_violations
            + self.unknown_parameters
            + self.derived_writes
            + self.non_finite_values
            + self.counter_regressions
            + self.negative_writable
            + self.after_finish
            + self.malformed_timestamps
    }
}

/// Consistent copy of a session's state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub metrics: Metrics,
    pub faults: FaultCounters,
    /// Number of observations applied so far.
    pub updates: u64,
}

/// Result of applying a full-vector tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub applied: usize,
    pub rejected: Vec<TelemetryError>,
}

/// Raw and derived state of one transport session.
#[derive(Debug, Clone)]
pub struct SessionState {
    metrics: Metrics,
    /// Timestamp of the last accepted update, per parameter.
    last_update: [Option<i64>; Parameter::COUNT],
    /// Explicit first-sample flags, only consulted with `FirstSample::Explicit`.
    initialized: [bool; Parameter::COUNT],
    /// Counter totals at the end of the previous interval.
    previous_sent_total: f64,
    previous_good_total: f64,
    first_sample: FirstSample,
    faults: FaultCounters,
    updates: u64,
}

impl SessionState {
    pub fn new(first_sample: FirstSample) -> Self {
        Self {
            metrics: Metrics::default(),
            last_update: [None; Parameter::COUNT],
            initialized: [false; Parameter::COUNT],
            previous_sent_total: 0.0,
            previous_good_total: 0.0,
            first_sample,
            faults: FaultCounters::default(),
            updates: 0,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn is_finished(&self) -> bool {
        self.metrics.finished
    }

    pub fn faults(&self) -> &FaultCounters {
        &self.faults
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            metrics: self.metrics,
            faults: self.faults,
            updates: self.updates,
        }
    }

    /// Count a field the decoder could not map to any registry member.
    pub fn record_unknown_parameter(&mut self, id: u32) -> TelemetryError {
        let error = TelemetryError::UnknownParameter(id);
        self.faults.record(&error);
        error
    }

    /// Apply one observation. On error the observation is dropped and the
    /// state is left untouched apart from the fault counters.
    pub fn update(&mut self, observation: RawObservation) -> Result<(), TelemetryError> {
        let result = self.try_update(observation);
        if let Err(error) = &result {
            self.faults.record(error);
        }
        result
    }

    fn try_update(&mut self, obs: RawObservation) -> Result<(), TelemetryError> {
        let RawObservation {
            parameter,
            value,
            timestamp,
        } = obs;

        if self.metrics.finished {
            return Err(TelemetryError::SessionFinished { parameter });
        }
        if !parameter.is_raw() {
            return Err(TelemetryError::DerivedParameter { parameter });
        }
        if !value.is_finite() {
            return Err(TelemetryError::NonFiniteValue { parameter });
        }
        let previous = self.last_update[parameter.index()];
        if let Some(last) = previous {
            if timestamp < last {
                return Err(TelemetryError::OrderingViolation {
                    parameter,
                    timestamp,
                    last,
                });
            }
        }
        let delta_t = interval(parameter, previous, timestamp)?;

        match parameter {
            Parameter::CurrWindowSize => {
                self.metrics.curr_window_size = value;
                self.refresh_writable();
            }
            Parameter::LastRtt | Parameter::ChunkRtt => {
                if parameter == Parameter::ChunkRtt {
                    self.metrics.chunk_rtt = value;
                }
                self.on_rtt_sample(value);
            }
            Parameter::SentBytes => {
                self.check_increment(parameter, value, self.metrics.sent_bytes)?;
                self.on_sent_bytes(value, delta_t);
            }
            Parameter::SentGoodBytes => {
                self.check_increment(parameter, value, self.metrics.sent_good_bytes)?;
                self.on_good_bytes(value, delta_t);
            }
            Parameter::Retransmissions => {
                self.check_increment(parameter, value, self.metrics.cumulative_retransmissions)?;
                let first = self.is_first(Parameter::EmaRetransmissions);
                self.metrics.cumulative_retransmissions += value;
                self.metrics.retransmissions = value;
                self.metrics.ema_retransmissions = exponential_moving_average(
                    self.metrics.ema_retransmissions,
                    value,
                    ALPHA,
                    first,
                );
                self.mark_initialized(Parameter::EmaRetransmissions);
            }
            Parameter::RcvBytes => {
                self.check_increment(parameter, value, self.metrics.rcv_bytes)?;
                self.metrics.rcv_bytes += value;
            }
            Parameter::PacketLoss => {
                self.check_increment(parameter, value, self.metrics.packet_loss)?;
                self.metrics.packet_loss += value;
            }
            Parameter::Timestamp => {
                self.metrics.timestamp = value;
            }
            Parameter::Finished => {
                if value != 0.0 {
                    tracing::debug!(timestamp, "Session reported finished");
                    self.metrics.finished = true;
                }
            }
            derived => return Err(TelemetryError::DerivedParameter { parameter: derived }),
        }

        self.last_update[parameter.index()] = Some(timestamp);
        if parameter != Parameter::Timestamp {
            self.metrics.timestamp = self.metrics.timestamp.max(timestamp as f64);
        }
        self.updates += 1;
        tracing::trace!(%parameter, value, timestamp, "Applied observation");
        Ok(())
    }

    /// Apply a full-vector tick field by field, converting cumulative
    /// counters into the increments the per-event path expects.
    /// Retransmissions already arrive per interval and pass through as is.
    ///
    /// Fields are applied in a fixed order and the finished flag last, so
    /// the counters carried by the final tick are still accounted for.
    pub fn apply_tick(&mut self, tick: &TelemetryTick) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let ts = tick.timestamp;

        let mut apply = |state: &mut Self, obs: RawObservation| match state.update(obs) {
            Ok(()) => outcome.applied += 1,
            Err(error) => outcome.rejected.push(error),
        };

        apply(self, RawObservation::new(Parameter::Timestamp, ts as f64, ts));
        apply(
            self,
            RawObservation::new(Parameter::CurrWindowSize, tick.curr_window_size, ts),
        );
        let counters = [
            (Parameter::SentBytes, tick.cumulative_sent_bytes),
            (Parameter::SentGoodBytes, tick.cumulative_sent_good_bytes),
            (Parameter::RcvBytes, tick.cumulative_rcv_bytes),
            (Parameter::PacketLoss, tick.cumulative_packet_loss),
        ];
        for (parameter, cumulative) in counters {
            let increment = cumulative - self.counter_total(parameter);
            apply(self, RawObservation::new(parameter, increment, ts));
        }
        apply(
            self,
            RawObservation::new(Parameter::Retransmissions, tick.retransmissions, ts),
        );
        // A tick repeats the latest RTT measurement; zero means none yet.
        if tick.last_rtt != 0.0 {
            apply(self, RawObservation::new(Parameter::LastRtt, tick.last_rtt, ts));
        }
        if tick.finished {
            apply(self, RawObservation::new(Parameter::Finished, 1.0, ts));
        }
        outcome
    }

    /// Finish the session without a telemetry sample, e.g. when the stream
    /// is lost. Returns `false` if it was already finished.
    pub fn mark_finished(&mut self) -> bool {
        !std::mem::replace(&mut self.metrics.finished, true)
    }

    /// Administrative drain of a session: returns the final state and resets
    /// to a fresh session, the only way to mutate state after FINISHED.
    pub fn drain(&mut self) -> StatsSnapshot {
        let last = self.snapshot();
        *self = Self::new(self.first_sample);
        last
    }

    fn counter_total(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::SentBytes => self.metrics.sent_bytes,
            Parameter::SentGoodBytes => self.metrics.sent_good_bytes,
            Parameter::RcvBytes => self.metrics.rcv_bytes,
            Parameter::PacketLoss => self.metrics.packet_loss,
            other => self.metrics.get(other),
        }
    }

    fn check_increment(
        &self,
        parameter: Parameter,
        increment: f64,
        total: f64,
    ) -> Result<(), TelemetryError> {
        if increment < 0.0 {
            return Err(TelemetryError::CounterRegression {
                parameter,
                value: total + increment,
                total,
            });
        }
        Ok(())
    }

    fn on_rtt_sample(&mut self, rtt: f64) {
        let m = &mut self.metrics;
        m.last_rtt = rtt;

        if rtt != 0.0 {
            m.min_rtt = match self.first_sample {
                FirstSample::ZeroSentinel => min_excluding_zero(m.min_rtt, rtt),
                FirstSample::Explicit if !self.initialized[Parameter::MinRtt.index()] => rtt,
                FirstSample::Explicit => m.min_rtt.min(rtt),
            };
            m.max_rtt = m.max_rtt.max(rtt);
            self.initialized[Parameter::MinRtt.index()] = true;
        }

        let first = self.is_first(Parameter::Srtt);
        let (srtt, var) = smoothed_rtt(self.metrics.srtt, self.metrics.var_rtt, rtt, first);
        self.metrics.srtt = srtt;
        self.metrics.var_rtt = var;
        self.mark_initialized(Parameter::Srtt);
    }

    fn on_sent_bytes(&mut self, increment: f64, delta_t: f64) {
        let first = self.is_first(Parameter::EmaThroughput);
        let m = &mut self.metrics;
        m.sent_bytes += increment;
        m.sent_bytes_timeframe = m.sent_bytes - self.previous_sent_total;
        m.throughput = estimators::throughput(m.sent_bytes_timeframe, delta_t);
        if delta_t > 0.0 {
            m.ema_throughput = exponential_moving_average(m.ema_throughput, m.throughput, ALPHA, first);
            self.initialized[Parameter::EmaThroughput.index()] = true;
        }
        self.previous_sent_total = self.metrics.sent_bytes;
        self.refresh_unacked();
    }

    fn on_good_bytes(&mut self, increment: f64, delta_t: f64) {
        let first = self.is_first(Parameter::EmaGoodput);
        let m = &mut self.metrics;
        m.sent_good_bytes += increment;
        m.sent_good_bytes_timeframe = m.sent_good_bytes - self.previous_good_total;
        m.goodput = estimators::throughput(m.sent_good_bytes_timeframe, delta_t);
        if delta_t > 0.0 {
            m.ema_goodput = exponential_moving_average(m.ema_goodput, m.goodput, ALPHA, first);
            self.initialized[Parameter::EmaGoodput.index()] = true;
        }
        self.previous_good_total = self.metrics.sent_good_bytes;
        self.refresh_unacked();
    }

    fn refresh_unacked(&mut self) {
        self.metrics.unack_bytes = self.metrics.sent_bytes - self.metrics.sent_good_bytes;
        self.refresh_writable();
    }

    fn refresh_writable(&mut self) {
        let writable = writable_bytes(self.metrics.curr_window_size, self.metrics.unack_bytes);
        if writable < 0.0 {
            self.faults.negative_writable += 1;
            tracing::warn!(
                cwnd = self.metrics.curr_window_size,
                unacked = self.metrics.unack_bytes,
                "More bytes in flight than the congestion window allows, clamping writable bytes to zero"
            );
            self.metrics.writable_bytes = 0.0;
        } else {
            self.metrics.writable_bytes = writable;
        }
    }

    fn is_first(&self, metric: Parameter) -> bool {
        match self.first_sample {
            FirstSample::ZeroSentinel => self.metrics.get(metric) == estimators::UNINITIALIZED,
            FirstSample::Explicit => !self.initialized[metric.index()],
        }
    }

    fn mark_initialized(&mut self, metric: Parameter) {
        self.initialized[metric.index()] = true;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(FirstSample::default())
    }
}

/// Time since the previous update of a parameter. The first update has no
/// reference point and counts as a zero interval.
fn interval(
    parameter: Parameter,
    previous: Option<i64>,
    timestamp: i64,
) -> Result<f64, TelemetryError> {
    match previous {
        Some(last) => timestamp
            .checked_sub(last)
            .map(|delta| delta as f64)
            .ok_or(TelemetryError::TimestampOverflow {
                parameter,
                timestamp,
                last,
            }),
        None => Ok(0.0),
    }
}
