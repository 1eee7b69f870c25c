use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use vendored protoc to avoid requiring users to install it
    let protoc = protoc_bin_vendored::protoc_bin_path()?;

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
    let proto_dir = PathBuf::from(manifest_dir).join("proto");

    println!("cargo:rerun-if-changed={}", proto_dir.display());

    let blocks_proto = proto_dir.join("bosun/v1/blocks.proto");
    let socket_proto = proto_dir.join("bosun/v1/socket.proto");
    let runner_proto = proto_dir.join("bosun/runner/v1/runner.proto");
    let eval_proto = proto_dir.join("bosun/eval/v1/eval.proto");

    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("bosun_descriptor.bin");

    let mut config = prost_build::Config::new();
    config.protoc_executable(protoc);
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(&descriptor_path)
        .type_attribute(".", "#[allow(clippy::large_enum_variant)]")
        .compile_protos_with_config(
            config,
            &[
                blocks_proto.to_str().unwrap(),
                socket_proto.to_str().unwrap(),
                runner_proto.to_str().unwrap(),
                eval_proto.to_str().unwrap(),
            ],
            &[proto_dir.to_str().unwrap()],
        )?;

    // Socket frames travel as proto3 JSON on websocket text frames, so every
    // message also gets the canonical JSON mapping via pbjson.
    let descriptor_set = std::fs::read(&descriptor_path)?;
    pbjson_build::Builder::new()
        .register_descriptors(&descriptor_set)?
        .build(&[".bosun"])?;

    Ok(())
}
