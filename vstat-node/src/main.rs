use clap::Parser;
use vstat_core::{signal, telemetry};
use vstat_node::{agent, config};

#[derive(Parser, Debug)]
#[command(version, about = "per-node agent for the v2ray-stat control plane")]
struct Args {
	/// Path to the YAML config file
	#[arg(short, long, value_name = "file")]
	config: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	let config = match config::load(&args.config) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("config error: {e}");
			std::process::exit(1);
		},
	};
	telemetry::init(config.log.loglevel, config.log.logmode);

	let shutdown = signal::Shutdown::new();
	let mut server = tokio::spawn(agent::serve(config, shutdown.token()));

	tokio::select! {
		res = &mut server => {
			match res {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					eprintln!("node agent failed: {e}");
					std::process::exit(1);
				}
				Err(e) => {
					eprintln!("node agent panicked: {e}");
					std::process::exit(1);
				}
			}
		}
		_ = shutdown.wait() => {
			// The server observes the cancelled token and drains.
			let _ = server.await;
		}
	}
}
