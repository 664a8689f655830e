//! Bridge between a transport's congestion controller and an external
//! decision process.
//!
//! The transport streams telemetry over RPC; the [`stats`] engine turns it
//! into derived metrics; the [`exchange`] hands snapshots to the decision
//! side and carries window updates back; the [`session`] supervisor keeps the
//! pipeline alive across stalls.

/// Telemetry RPC endpoint and wire codec.
pub mod adapter;

/// Server configuration.
pub mod config;

/// Decision process contract and built-in fixed policies.
pub mod decision;

/// Snapshot and action hand-off between stream tasks and the decision loop.
pub mod exchange;

/// Stable metric identifiers.
pub mod parameters;

/// Entry points for the binary.
pub mod server;

/// Session lifecycle supervision.
pub mod session;

/// Statistics engine.
pub mod stats;

/// Logging infrastructure.
pub mod tracing;
