fn main() {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc"),
    );
    println!("cargo:rerun-if-changed=./jobworker.proto");
    tonic_build::compile_protos("./jobworker.proto")
        .unwrap_or_else(|err| panic!("Failed to compile protos {:?}", err));
}
