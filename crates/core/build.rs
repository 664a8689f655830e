fn main() {
    // Use the vendored protoc binary so no system installation is required.
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc not found");
    std::env::set_var("PROTOC", protoc);

    println!("cargo:rerun-if-changed=proto/congestion_control.proto");
    tonic_build::configure()
        .compile_protos(&["proto/congestion_control.proto"], &["proto/"])
        .expect("failed to compile proto/congestion_control.proto");
}
