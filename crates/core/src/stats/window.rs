//! Windowed aggregates over observation histories and the flat vector handed
//! to the decision process.

use std::collections::VecDeque;

use serde::Serialize;

use super::engine::Metrics;
use super::estimators::{self, exponential_moving_average, ALPHA};
use super::FirstSample;
use crate::parameters::{intersection, Observation, Parameter, Statistic};

/// Bytes per packet used to estimate packets sent in an interval.
pub const PACKET_SIZE_BYTES: f64 = 1444.0;

/// Below this many samples every aggregate except EMA reports `LAST`.
const MIN_SAMPLES_FOR_AGGREGATES: usize = 3;

/// Aggregates of one observation's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatisticSummary {
    pub last: f64,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub ema: f64,
    pub diff: f64,
}

impl StatisticSummary {
    pub fn get(&self, statistic: Statistic) -> f64 {
        match statistic {
            Statistic::Last => self.last,
            Statistic::Mean => self.mean,
            Statistic::Std => self.std,
            Statistic::Min => self.min,
            Statistic::Max => self.max,
            Statistic::Ema => self.ema,
            Statistic::Diff => self.diff,
        }
    }

    fn set(&mut self, statistic: Statistic, value: f64) {
        match statistic {
            Statistic::Last => self.last = value,
            Statistic::Mean => self.mean = value,
            Statistic::Std => self.std = value,
            Statistic::Min => self.min = value,
            Statistic::Max => self.max = value,
            Statistic::Ema => self.ema = value,
            Statistic::Diff => self.diff = value,
        }
    }
}

/// Value of every observation for a metrics snapshot, in vector order.
///
/// Observations backed by a registry parameter are copied through
/// [`intersection`]; the rest are computed here.
pub fn observation_values(metrics: &Metrics) -> [f64; Observation::COUNT] {
    let mut values = [0.0; Observation::COUNT];
    for (observation, parameter) in intersection() {
        values[observation.index()] = metrics.get(parameter);
    }
    values[Observation::PacketsTransmitted.index()] =
        (metrics.get(Parameter::SentBytesTimeframe) / PACKET_SIZE_BYTES).ceil();
    values
}

#[derive(Debug, Clone)]
struct History {
    samples: VecDeque<f64>,
    capacity: Option<usize>,
    ema_initialized: bool,
}

impl History {
    fn new(capacity: Option<usize>) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.unwrap_or(64)),
            capacity,
            ema_initialized: false,
        }
    }

    fn push(&mut self, value: f64) {
        if let Some(cap) = self.capacity {
            while self.samples.len() >= cap.max(1) {
                self.samples.pop_front();
            }
        }
        self.samples.push_back(value);
    }
}

/// Per-observation histories and their aggregates for one session.
///
/// Histories grow with every recorded snapshot, optionally capped, and are
/// cleared on [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct WindowedStatistics {
    histories: Vec<History>,
    summaries: [StatisticSummary; Observation::COUNT],
    first_sample: FirstSample,
    capacity: Option<usize>,
}

impl WindowedStatistics {
    pub fn new(capacity: Option<usize>, first_sample: FirstSample) -> Self {
        Self {
            histories: (0..Observation::COUNT)
                .map(|_| History::new(capacity))
                .collect(),
            summaries: [StatisticSummary::default(); Observation::COUNT],
            first_sample,
            capacity,
        }
    }

    /// Append the latest value of every observation and recompute the
    /// aggregates.
    pub fn record(&mut self, metrics: &Metrics) {
        let values = observation_values(metrics);
        for observation in Observation::ORDER {
            let idx = observation.index();
            let history = &mut self.histories[idx];
            let value = values[idx];
            history.push(value);

            let summary = &mut self.summaries[idx];
            let first = match self.first_sample {
                FirstSample::ZeroSentinel => summary.ema == estimators::UNINITIALIZED,
                FirstSample::Explicit => !history.ema_initialized,
            };
            summary.ema = exponential_moving_average(summary.ema, value, ALPHA, first);
            history.ema_initialized = true;
            summary.last = value;

            let samples = history.samples.make_contiguous();
            if samples.len() < MIN_SAMPLES_FOR_AGGREGATES {
                for statistic in [
                    Statistic::Mean,
                    Statistic::Std,
                    Statistic::Min,
                    Statistic::Max,
                    Statistic::Diff,
                ] {
                    summary.set(statistic, value);
                }
                continue;
            }
            summary.min = samples.iter().copied().fold(f64::INFINITY, f64::min);
            summary.max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            summary.mean = estimators::mean(samples);
            summary.std = estimators::sample_std(samples);
            summary.diff = value - samples[samples.len() - 2];
        }
    }

    pub fn summary(&self, observation: Observation) -> &StatisticSummary {
        &self.summaries[observation.index()]
    }

    pub fn len(&self) -> usize {
        self.histories
            .first()
            .map(|h| h.samples.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.capacity, self.first_sample);
    }
}

/// Flat numeric state vector in the order fixed by [`Observation::ORDER`]
/// (and [`Statistic::ORDER`] in windowed mode).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationVector {
    pub values: Vec<f64>,
    pub windowed: bool,
}

impl ObservationVector {
    /// Length of the vector in each layout.
    pub const fn len_for(windowed: bool) -> usize {
        if windowed {
            Observation::COUNT * Statistic::COUNT
        } else {
            Observation::COUNT
        }
    }

    /// All-zero vector, the observation before any telemetry arrived.
    pub fn zeroed(windowed: bool) -> Self {
        Self {
            values: vec![0.0; Self::len_for(windowed)],
            windowed,
        }
    }

    pub fn from_metrics(metrics: &Metrics) -> Self {
        Self {
            values: observation_values(metrics).to_vec(),
            windowed: false,
        }
    }

    /// Observation-major, statistic-minor.
    pub fn from_window(window: &WindowedStatistics) -> Self {
        let values = Observation::ORDER
            .iter()
            .flat_map(|o| {
                let summary = window.summary(*o);
                Statistic::ORDER.iter().map(move |s| summary.get(*s))
            })
            .collect();
        Self {
            values,
            windowed: true,
        }
    }

    /// Split a plain vector back into `(observation, value)` pairs.
    pub fn decode(&self) -> Option<Vec<(Observation, f64)>> {
        if self.windowed || self.values.len() != Observation::COUNT {
            return None;
        }
        Some(Observation::ORDER.iter().copied().zip(self.values.iter().copied()).collect())
    }

    /// Split a windowed vector back into per-observation summaries.
    pub fn decode_windowed(&self) -> Option<Vec<(Observation, StatisticSummary)>> {
        if !self.windowed || self.values.len() != Self::len_for(true) {
            return None;
        }
        let decoded = Observation::ORDER
            .iter()
            .zip(self.values.chunks_exact(Statistic::COUNT))
            .map(|(o, chunk)| {
                let mut summary = StatisticSummary::default();
                for (statistic, value) in Statistic::ORDER.iter().zip(chunk) {
                    summary.set(*statistic, *value);
                }
                (*o, summary)
            })
            .collect();
        Some(decoded)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{RawObservation, SessionState};

    fn metrics_with_rtt(rtt: f64) -> Metrics {
        Metrics {
            last_rtt: rtt,
            curr_window_size: 1000.0,
            ..Default::default()
        }
    }

    #[test]
    fn short_history_falls_back_to_last() {
        let mut window = WindowedStatistics::new(None, FirstSample::ZeroSentinel);
        window.record(&metrics_with_rtt(10.0));
        window.record(&metrics_with_rtt(30.0));

        let s = window.summary(Observation::LastRtt);
        assert_eq!(s.last, 30.0);
        assert_eq!(s.mean, 30.0);
        assert_eq!(s.std, 30.0);
        assert_eq!(s.min, 30.0);
        assert_eq!(s.max, 30.0);
        assert_eq!(s.diff, 30.0);
        assert_eq!(s.ema, 0.875 * 10.0 + 0.125 * 30.0);
    }

    #[test]
    fn aggregates_after_three_samples() {
        let mut window = WindowedStatistics::new(None, FirstSample::ZeroSentinel);
        for rtt in [10.0, 30.0, 20.0] {
            window.record(&metrics_with_rtt(rtt));
        }
        let s = window.summary(Observation::LastRtt);
        assert_eq!(s.last, 20.0);
        assert_eq!(s.mean, 20.0);
        assert_eq!(s.std, 10.0);
        assert_eq!(s.min, 10.0);
        assert_eq!(s.max, 30.0);
        assert_eq!(s.diff, -10.0);
    }

    #[test]
    fn capped_history_evicts_oldest() {
        let mut window = WindowedStatistics::new(Some(3), FirstSample::ZeroSentinel);
        for rtt in [100.0, 10.0, 20.0, 30.0] {
            window.record(&metrics_with_rtt(rtt));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.summary(Observation::LastRtt).max, 30.0);

        window.reset();
        assert!(window.is_empty());
        assert_eq!(window.summary(Observation::LastRtt), &StatisticSummary::default());
    }

    #[test]
    fn packets_transmitted_rounds_up() {
        let metrics = Metrics {
            sent_bytes_timeframe: 1445.0,
            ..Default::default()
        };
        let values = observation_values(&metrics);
        assert_eq!(values[Observation::PacketsTransmitted.index()], 2.0);
        assert_eq!(values[Observation::SentBytesTimeframe.index()], 1445.0);
    }

    #[test]
    fn plain_vector_round_trips_against_registry_order() {
        let mut state = SessionState::default();
        state
            .update(RawObservation::new(Parameter::CurrWindowSize, 4000.0, 0))
            .unwrap();
        state
            .update(RawObservation::new(Parameter::SentBytes, 2888.0, 0))
            .unwrap();
        state
            .update(RawObservation::new(Parameter::LastRtt, 42.0, 0))
            .unwrap();
        let metrics = *state.metrics();

        let vector = ObservationVector::from_metrics(&metrics);
        assert_eq!(vector.len(), Observation::COUNT);
        for (observation, value) in vector.decode().unwrap() {
            match observation.parameter() {
                Some(parameter) => assert_eq!(value, metrics.get(parameter), "{observation}"),
                None => assert_eq!(value, 2.0),
            }
        }
        assert!(vector.decode_windowed().is_none());
    }

    #[test]
    fn windowed_vector_round_trips() {
        let mut window = WindowedStatistics::new(None, FirstSample::ZeroSentinel);
        for rtt in [5.0, 15.0, 25.0, 35.0] {
            window.record(&metrics_with_rtt(rtt));
        }
        let vector = ObservationVector::from_window(&window);
        assert_eq!(vector.len(), Observation::COUNT * Statistic::COUNT);
        for (observation, summary) in vector.decode_windowed().unwrap() {
            assert_eq!(&summary, window.summary(observation));
        }
        assert_eq!(ObservationVector::zeroed(true).len(), vector.len());
    }
}
