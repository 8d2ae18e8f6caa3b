//! Types shared by both ends of the refinement stream.
//!
//! - [`error`] - the unified error type and its `tonic::Status` mapping.
//! - [`timing`] - the timing contract and cancellable sleeps.
//! - [`buffer`] - the client-side revision buffer.

pub mod buffer;
pub mod error;
pub mod timing;

pub use buffer::VersionBuffer;
pub use error::{Error, Result};
