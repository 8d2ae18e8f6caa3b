//! gRPC service entry point.
//!
//! - [`handler`] - `SearchService`, the `SearchRefiner` implementation.

pub mod handler;
