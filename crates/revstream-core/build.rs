/// Builds the gRPC client and server code for `revstream.proto` using
/// `tonic-prost-build`.
///
/// The generated module is included from `revstream_core::proto` and contains
/// the `SearchRefiner` service traits plus the three message types. An encoded
/// `FileDescriptorSet` is written next to it so the server can expose gRPC
/// reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/revstream.proto`
/// - Includes: `proto/`
/// - Descriptor: `$OUT_DIR/revstream_descriptor.bin`
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("revstream_descriptor.bin");

    println!("cargo:rerun-if-changed=proto/revstream.proto");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure().compile_with_config(
        config,
        &["proto/revstream.proto"],
        &["proto"],
    )?;

    Ok(())
}
