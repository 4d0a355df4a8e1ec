fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/hypercards/hypercards.proto");

    // Vendored protoc so builds do not depend on a system install
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/hypercards/hypercards.proto"], &["proto"])?;
    Ok(())
}
