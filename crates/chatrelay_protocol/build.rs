use std::env;
use std::path::PathBuf;

fn main() {
	println!("cargo:rerun-if-changed=../../proto");
	println!("cargo:rerun-if-changed=../../proto/chatrelay.proto");

	let proto_dir = PathBuf::from("../../proto");
	let proto_file = proto_dir.join("chatrelay.proto");

	let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR must be set by Cargo"));

	let protos = [proto_file];
	let includes = [proto_dir];

	let mut config = prost_build::Config::new();

	config.out_dir(out_dir);
	config.bytes([".chatrelay.v1.Packet.body"]);

	config
		.compile_protos(&protos, &includes)
		.expect("failed to compile protobuf definitions with prost");
}
