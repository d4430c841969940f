//! Build script for ojp-proto.
//!
//! Compiles the protobuf wire contract into Rust code using
//! tonic-prost-build. Both the client (driver) and the server trait
//! (used by the in-process mock) are generated.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo::rerun-if-changed=../../proto/ojp/v1/ojp.proto");

    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../../proto/ojp/v1/ojp.proto"], &["../../proto"])?;

    Ok(())
}
