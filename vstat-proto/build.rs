// Generates the gRPC stubs for the node RPC surface, the subscription
// stream, and the proxy-core stats API subset. protox compiles the proto
// sources so no protoc binary is needed at build time.
use prost::Message;

fn main() -> Result<(), anyhow::Error> {
	let proto_files = [
		"proto/node.proto",
		"proto/subscription.proto",
		"proto/stats.proto",
	]
	.iter()
	.map(|name| std::env::current_dir().unwrap().join(name))
	.collect::<Vec<_>>();
	let include_dirs = ["proto/"]
		.iter()
		.map(|i| std::env::current_dir().unwrap().join(i))
		.collect::<Vec<_>>();

	let fds = protox::compile(&proto_files, &include_dirs)?;
	let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);
	let fds_path = out_dir.join("vstat_descriptor.bin");
	std::fs::write(&fds_path, fds.encode_to_vec())?;

	let mut config = prost_build::Config::new();
	config.file_descriptor_set_path(&fds_path);
	config.skip_protoc_run();
	config.disable_comments(Some("."));
	tonic_build::configure()
		.build_server(true)
		.compile_protos_with_config(
			config,
			&proto_files
				.iter()
				.map(|path| path.to_str().unwrap())
				.collect::<Vec<_>>(),
			&include_dirs
				.iter()
				.map(|p| p.to_str().unwrap())
				.collect::<Vec<_>>(),
		)?;

	for path in [proto_files, include_dirs].concat() {
		println!("cargo:rerun-if-changed={}", path.to_str().unwrap());
	}

	Ok(())
}
