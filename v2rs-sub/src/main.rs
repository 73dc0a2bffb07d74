use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use v2rs_sub::http::HttpState;
use v2rs_sub::{config, http, stream};
use vstat_core::{signal, telemetry};

#[derive(Parser, Debug)]
#[command(version, about = "subscription service for the v2ray-stat control plane")]
struct Args {
	/// Path to the YAML config file
	#[arg(short, long, value_name = "file")]
	config: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	let config = match config::load(&args.config) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("config error: {e}");
			std::process::exit(1);
		},
	};
	telemetry::init(config.log.loglevel, config.log.logmode);

	let hub = stream::DataHub::new();
	let shutdown = signal::Shutdown::new();

	let grpc_addr: SocketAddr =
		match format!("{}:{}", config.service.address, config.service.grpc_port).parse() {
			Ok(addr) => addr,
			Err(e) => {
				eprintln!("config error: bad grpc address: {e}");
				std::process::exit(1);
			},
		};
	let http_addr: SocketAddr =
		match format!("{}:{}", config.service.address, config.service.port).parse() {
			Ok(addr) => addr,
			Err(e) => {
				eprintln!("config error: bad http address: {e}");
				std::process::exit(1);
			},
		};

	let mut grpc = tokio::spawn(stream::serve(hub.clone(), grpc_addr, shutdown.token()));
	let state = HttpState {
		hub,
		tree: Arc::new(config.subscription),
	};
	let mut web = tokio::spawn(http::serve(state, http_addr, shutdown.token()));

	let fail = |name: &str, res: Result<anyhow::Result<()>, tokio::task::JoinError>| {
		match res {
			Ok(Ok(())) => {},
			Ok(Err(e)) => {
				eprintln!("{name} server failed: {e}");
				std::process::exit(1);
			},
			Err(e) => {
				eprintln!("{name} server panicked: {e}");
				std::process::exit(1);
			},
		}
	};
	tokio::select! {
		res = &mut grpc => {
			fail("grpc", res);
		}
		res = &mut web => {
			fail("http", res);
		}
		_ = shutdown.wait() => {
			fail("grpc", grpc.await);
			fail("http", web.await);
		}
	}
}
