use clap::Parser;
use v2ray_stat::{app, config};
use vstat_core::telemetry;

#[derive(Parser, Debug)]
#[command(version, about = "control plane and telemetry aggregator for a proxy-node fleet")]
struct Args {
	/// Path to the YAML config file
	#[arg(short, long, value_name = "file")]
	config: std::path::PathBuf,
}

fn main() {
	let args = Args::parse();
	let config = match config::load(&args.config) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("config error: {e}");
			std::process::exit(1);
		},
	};

	// Must happen before the runtime spawns worker threads so every
	// Local-timezone render sees it.
	unsafe {
		std::env::set_var("TZ", &config.timezone);
	}
	telemetry::init(config.log.loglevel, config.log.logmode);

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(runtime) => runtime,
		Err(e) => {
			eprintln!("runtime error: {e}");
			std::process::exit(1);
		},
	};
	if let Err(e) = runtime.block_on(app::run(config)) {
		eprintln!("fatal: {e}");
		std::process::exit(1);
	}
}
