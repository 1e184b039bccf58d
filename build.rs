fn main() -> std::io::Result<()> {
    let protos = ["src/proto/session.proto"];
    let mut prost_build = prost_build::Config::new();
    prost_build.compile_protos(&protos, &["src"])
}
