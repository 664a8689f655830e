//! Stable identifier space for raw and derived telemetry metrics.
//!
//! Identifiers are part of the wire contract: a [`Parameter`] id that has
//! shipped in telemetry is never reused for a different meaning. New metrics
//! get new ids.
//!
//! Three enumerations live here:
//!
//! - [`Parameter`]: every metric the statistics engine knows about, raw
//!   (reported by the transport) or derived (computed by the engine).
//! - [`Observation`]: the fixed-order subset exposed to the decision
//!   process as a flat numeric vector.
//! - [`Statistic`]: the aggregates computed per observation in windowed mode.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a metric arrives from telemetry or is computed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    Raw,
    Derived,
}

macro_rules! parameters {
    ($($variant:ident = $id:literal, $name:literal, $kind:ident;)+) => {
        /// A metric identifier from the versioned parameter registry.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum Parameter {
            $($variant,)+
        }

        impl Parameter {
            /// Every parameter, in registry order.
            pub const ALL: &'static [Parameter] = &[$(Parameter::$variant,)+];

            /// Number of registered parameters.
            pub const COUNT: usize = Self::ALL.len();

            /// Stable wire identifier.
            pub const fn id(self) -> u32 {
                match self {
                    $(Parameter::$variant => $id,)+
                }
            }

            /// Look up a parameter by its wire identifier.
            pub const fn from_id(id: u32) -> Option<Parameter> {
                match id {
                    $($id => Some(Parameter::$variant),)+
                    _ => None,
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Parameter::$variant => $name,)+
                }
            }

            pub const fn kind(self) -> ParameterKind {
                match self {
                    $(Parameter::$variant => ParameterKind::$kind,)+
                }
            }
        }
    };
}

parameters! {
    CurrWindowSize = 1, "CURR_WINDOW_SIZE", Raw;
    SentBytes = 2, "SENT_BYTES", Raw;
    RcvBytes = 3, "RCV_BYTES", Raw;
    SentGoodBytes = 4, "SENT_GOOD_BYTES", Raw;
    SentBytesTimeframe = 5, "SENT_BYTES_TIMEFRAME", Derived;
    SentGoodBytesTimeframe = 6, "SENT_GOOD_BYTES_TIMEFRAME", Derived;
    UnackBytes = 7, "UNACK_BYTES", Derived;
    CumulativeRetransmissions = 8, "CUMULATIVE_RETRANSMISSIONS", Derived;
    Retransmissions = 9, "RETRANSMISSIONS", Raw;
    EmaRetransmissions = 10, "EMA_RETRANSMISSIONS", Derived;
    WritableBytes = 11, "WRITABLE_BYTES", Derived;
    LastRtt = 12, "LAST_RTT", Raw;
    MinRtt = 13, "MIN_RTT", Derived;
    MaxRtt = 14, "MAX_RTT", Derived;
    Srtt = 15, "SRTT", Derived;
    VarRtt = 16, "VAR_RTT", Derived;
    Timestamp = 17, "TIMESTAMP", Raw;
    Finished = 18, "FINISHED", Raw;
    ChunkRtt = 19, "CHUNK_RTT", Raw;
    PacketLoss = 20, "PACKET_LOSS", Raw;
    Throughput = 101, "THROUGHPUT", Derived;
    Goodput = 102, "GOODPUT", Derived;
    EmaThroughput = 104, "EMA_THROUGHPUT", Derived;
    EmaGoodput = 105, "EMA_GOODPUT", Derived;
}

impl Parameter {
    /// Position of this parameter inside [`Parameter::ALL`], used to index
    /// per-parameter bookkeeping arrays.
    pub fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|p| *p == self)
            .unwrap_or_default()
    }

    pub fn is_raw(self) -> bool {
        self.kind() == ParameterKind::Raw
    }

    /// Both RTT channels feed the same estimator.
    pub fn is_rtt_sample(self) -> bool {
        matches!(self, Parameter::LastRtt | Parameter::ChunkRtt)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metrics exposed to the decision process, in vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Observation {
    CurrWindowSize,
    SentBytesTimeframe,
    SentGoodBytesTimeframe,
    UnackBytes,
    Retransmissions,
    LastRtt,
    MinRtt,
    MaxRtt,
    Srtt,
    VarRtt,
    Throughput,
    Goodput,
    PacketsTransmitted,
}

impl Observation {
    /// The external state vector layout. Reordering this breaks every
    /// trained policy.
    pub const ORDER: [Observation; 13] = [
        Observation::CurrWindowSize,
        Observation::SentBytesTimeframe,
        Observation::SentGoodBytesTimeframe,
        Observation::UnackBytes,
        Observation::Retransmissions,
        Observation::LastRtt,
        Observation::MinRtt,
        Observation::MaxRtt,
        Observation::Srtt,
        Observation::VarRtt,
        Observation::Throughput,
        Observation::Goodput,
        Observation::PacketsTransmitted,
    ];

    pub const COUNT: usize = Self::ORDER.len();

    pub const fn id(self) -> u32 {
        match self {
            Observation::CurrWindowSize => 1,
            Observation::SentBytesTimeframe => 5,
            Observation::SentGoodBytesTimeframe => 6,
            Observation::UnackBytes => 7,
            Observation::Retransmissions => 9,
            Observation::LastRtt => 12,
            Observation::MinRtt => 13,
            Observation::MaxRtt => 14,
            Observation::Srtt => 15,
            Observation::VarRtt => 16,
            Observation::Throughput => 101,
            Observation::Goodput => 102,
            Observation::PacketsTransmitted => 103,
        }
    }

    pub fn index(self) -> usize {
        Self::ORDER
            .iter()
            .position(|o| *o == self)
            .unwrap_or_default()
    }

    /// The registry parameter sharing this observation's id, if any.
    pub fn parameter(self) -> Option<Parameter> {
        Parameter::from_id(self.id())
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parameter() {
            Some(p) => f.write_str(p.name()),
            None => f.write_str("PACKETS_TRANSMITTED"),
        }
    }
}

/// Observations backed directly by a registry parameter, in vector order.
///
/// Values for these are propagated from engine snapshots without a manual
/// mapping table; the remaining observations are computed on the decision
/// side.
pub fn intersection() -> Vec<(Observation, Parameter)> {
    Observation::ORDER
        .iter()
        .filter_map(|o| o.parameter().map(|p| (*o, p)))
        .collect()
}

/// Per-observation aggregate in windowed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Statistic {
    Last,
    Mean,
    Std,
    Min,
    Max,
    Ema,
    Diff,
}

impl Statistic {
    pub const ORDER: [Statistic; 7] = [
        Statistic::Last,
        Statistic::Mean,
        Statistic::Std,
        Statistic::Min,
        Statistic::Max,
        Statistic::Ema,
        Statistic::Diff,
    ];

    pub const COUNT: usize = Self::ORDER.len();

    pub const fn id(self) -> u32 {
        match self {
            Statistic::Last => 1,
            Statistic::Mean => 2,
            Statistic::Std => 3,
            Statistic::Min => 4,
            Statistic::Max => 5,
            Statistic::Ema => 6,
            Statistic::Diff => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_round_trip() {
        let mut seen = HashSet::new();
        for p in Parameter::ALL {
            assert!(seen.insert(p.id()), "duplicate id {}", p.id());
            assert_eq!(Parameter::from_id(p.id()), Some(*p));
        }
        assert_eq!(Parameter::from_id(0), None);
        assert_eq!(Parameter::from_id(103), None);
    }

    #[test]
    fn shipped_ids_are_stable() {
        assert_eq!(Parameter::CurrWindowSize.id(), 1);
        assert_eq!(Parameter::SentBytes.id(), 2);
        assert_eq!(Parameter::LastRtt.id(), 12);
        assert_eq!(Parameter::Timestamp.id(), 17);
        assert_eq!(Parameter::Finished.id(), 18);
        assert_eq!(Parameter::Throughput.id(), 101);
    }

    #[test]
    fn index_matches_position() {
        for (i, p) in Parameter::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
        for (i, o) in Observation::ORDER.iter().enumerate() {
            assert_eq!(o.index(), i);
        }
    }

    #[test]
    fn intersection_skips_observation_only_metrics() {
        let common = intersection();
        assert_eq!(common.len(), Observation::COUNT - 1);
        assert!(common
            .iter()
            .all(|(o, p)| o.id() == p.id() && *o != Observation::PacketsTransmitted));
        // order follows the observation vector
        assert_eq!(common[0], (Observation::CurrWindowSize, Parameter::CurrWindowSize));
        assert_eq!(common.last(), Some(&(Observation::Goodput, Parameter::Goodput)));
    }

    #[test]
    fn display_uses_wire_names() {
        assert_eq!(Parameter::EmaThroughput.to_string(), "EMA_THROUGHPUT");
        assert_eq!(Observation::PacketsTransmitted.to_string(), "PACKETS_TRANSMITTED");
        assert_eq!(Observation::Srtt.to_string(), "SRTT");
    }
}
