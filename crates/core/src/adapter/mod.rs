//! Telemetry stream adapter.
//!
//! Terminates the bidirectional RPC streams opened by the transport. Each
//! stream claims the session currently parked in the
//! [`SessionBinding`](crate::session::SessionBinding) and is served by two
//! tasks: one owns the [`SessionState`](crate::stats::SessionState) and feeds
//! it inbound telemetry, the other forwards actions back. They only talk
//! through the exchange, so a slow decision process never holds up the
//! receive loop.

pub mod codec;
mod service;

pub use service::{AdapterSettings, TelemetryService};

// Generated protobuf / tonic code (compiled by build.rs)
#[allow(clippy::all)]
#[allow(clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("congestioncontrol");
}
