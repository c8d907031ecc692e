fn main() {
    println!("cargo:rerun-if-changed=proto/utcp.proto");
    println!("cargo:rerun-if-changed=proto/gnmi.proto");
    tonic_build::configure()
        .build_server(true)
        .compile(&["proto/utcp.proto", "proto/gnmi.proto"], &["proto"])
        .expect("failed to compile protobuf definitions");
}
