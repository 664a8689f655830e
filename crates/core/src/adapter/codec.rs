//! Conversions between the protobuf messages and the engine's types.

use super::proto;
use crate::exchange::Action;
use crate::parameters::Parameter;
use crate::stats::{RawObservation, SessionState, TelemetryError, TelemetryTick};

/// An inbound message shape the adapter can feed into a session.
pub trait TelemetryMessage: Send + 'static {
    /// Shape name used in logs.
    const SHAPE: &'static str;

    /// Apply every field to `state`, returning the ones that were skipped.
    fn apply_to(&self, state: &mut SessionState) -> Vec<TelemetryError>;
}

/// Full-vector message to a tick.
///
/// Aggregates the transport computes on its own (min/max/smoothed RTT,
/// in-flight bytes, per-interval byte deltas) are dropped here. The engine
/// derives them from the raw counters so both shapes agree.
pub fn tick_from_proto(msg: &proto::CommunicationState) -> TelemetryTick {
    TelemetryTick {
        timestamp: msg.timestamp,
        curr_window_size: msg.curr_window_size as f64,
        cumulative_sent_bytes: msg.cumulative_sent_bytes as f64,
        cumulative_rcv_bytes: msg.cumulative_rcv_bytes as f64,
        cumulative_sent_good_bytes: msg.cumulative_sent_good_bytes as f64,
        retransmissions: msg.retransmissions as f64,
        cumulative_packet_loss: msg.cumulative_packet_loss as f64,
        last_rtt: msg.last_rtt as f64,
        finished: msg.finished,
    }
}

pub fn observation_from_proto(
    msg: &proto::ParameterUpdate,
) -> Result<RawObservation, TelemetryError> {
    let parameter =
        Parameter::from_id(msg.parameter).ok_or(TelemetryError::UnknownParameter(msg.parameter))?;
    Ok(RawObservation::new(parameter, msg.value, msg.timestamp))
}

pub fn action_to_proto(action: &Action) -> proto::Action {
    proto::Action {
        cwnd_update: action.cwnd,
    }
}

impl TelemetryMessage for proto::CommunicationState {
    const SHAPE: &'static str = "tick";

    fn apply_to(&self, state: &mut SessionState) -> Vec<TelemetryError> {
        state.apply_tick(&tick_from_proto(self)).rejected
    }
}

impl TelemetryMessage for proto::ParameterUpdate {
    const SHAPE: &'static str = "event";

    fn apply_to(&self, state: &mut SessionState) -> Vec<TelemetryError> {
        let result = match observation_from_proto(self) {
            Ok(observation) => state.update(observation),
            Err(_) => Err(state.record_unknown_parameter(self.parameter)),
        };
        result.err().into_iter().collect()
    }
}
