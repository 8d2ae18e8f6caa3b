//! Server side of the refinement protocol.
//!
//! - [`config`] - CLI/env configuration.
//! - [`service`] - the tonic service and per-call task spawning.
//! - [`session`] - the per-stream state machine.
//! - [`telemetry`] - logging and optional OpenTelemetry export.

pub mod config;
pub mod service;
pub mod session;
pub mod telemetry;
