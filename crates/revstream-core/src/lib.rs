#![doc = include_str!("../README.md")]

mod common;
pub mod generator;

pub use common::*;

/// gRPC service and message definitions generated from
/// `proto/revstream.proto`.
///
/// ## Service
///
/// - `SearchRefiner/Refine` - one bidirectional stream per logical call,
///   `stream RequestContext` in, `stream ResponseBatch` out.
///
/// ## Messages
///
/// - [`RequestContext`](proto::RequestContext) - a wave of search intent.
/// - [`ResponseItem`](proto::ResponseItem) - one scored result.
/// - [`ResponseBatch`](proto::ResponseBatch) - a revision of the result list.
pub mod proto {
    tonic::include_proto!("revstream");

    /// Encoded `FileDescriptorSet` for gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("revstream_descriptor");
}
