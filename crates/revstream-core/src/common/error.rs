//! Error types for the refinement protocol.
//!
//! This module defines the central `Error` enum shared by the client and the
//! server. It implements `From<Error>` for `tonic::Status` so server-side
//! failures propagate to the peer with an appropriate status code.
//!
//! ## Error Cases
//! - `Connect`: The client could not establish a channel. Hard failure.
//! - `StreamOpen`: The channel exists but the `Refine` call was rejected.
//!   Hard failure.
//! - `ChannelError`: An internal communication failure between tasks.
//! - `ClientGone`: A write hit a stream whose receiver has been dropped.
//! - `ProtocolViolation`: A peer sent something the state machine rejects.
//! - `Transport`: The stream failed after at least one message went out.
//! - `ServiceShutdown`: The session was torn down by server shutdown.
//!
//! Only `Connect`, `StreamOpen` and `ProtocolViolation` are meant to reach a
//! top-level caller; the rest are absorbed by the state machines.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the refinement protocol.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// Establishing the transport channel failed.
    #[error("Failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The server refused or failed to open the bidirectional call.
    #[error("Failed to open stream: {0}")]
    StreamOpen(Status),

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The remote half of the stream is gone; nothing more can be written.
    #[error("Peer disconnected")]
    ClientGone,

    /// The peer broke the message sequencing contract.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// The stream failed mid-flight.
    #[error("Transport error: {0}")]
    Transport(Status),

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Whether this error must be surfaced to the caller rather than degraded
    /// into a "no result" outcome.
    pub const fn is_hard(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::StreamOpen(_) | Self::ProtocolViolation { .. }
        )
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Connect { endpoint, reason } => {
                Status::unavailable(format!("Connect to {endpoint} failed: {reason}"))
            }
            Error::StreamOpen(status) | Error::Transport(status) => status,
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {context}"))
            }
            Error::ClientGone => Status::cancelled("Peer disconnected"),
            Error::ProtocolViolation { reason } => Status::invalid_argument(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
