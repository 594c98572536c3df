use prost::Message;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    // protox compiles the proto in-process, so no system protoc is needed.
    let fds = protox::compile(["proto/storageagent.proto"], ["proto"])?;
    std::fs::write(
        out_dir.join("storageagent_descriptor.bin"),
        fds.encode_to_vec(),
    )?;

    tonic_prost_build::configure().compile_fds(fds)?;

    println!("cargo:rerun-if-changed=proto/storageagent.proto");
    Ok(())
}
