use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = PathBuf::from("../proto");
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    println!("cargo:rerun-if-changed=../proto/dispatch/v1/");

    // Client and server both live here: every service dispatches and every
    // service accepts tunneled calls.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("dispatch_descriptor.bin"))
        .compile_protos(&["../proto/dispatch/v1/dispatch.proto"], &[&proto_root])?;

    Ok(())
}
