//! Wires config, store, fleet, loops, API and the subscription stream
//! together and owns the shutdown sequence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vstat_core::signal::Shutdown;

use crate::api::{self, ApiState};
use crate::config::Config;
use crate::fleet::client::DEFAULT_RPC_TIMEOUT;
use crate::fleet::{Coordinator, FleetClient};
use crate::monitor::Monitor;
use crate::store::{Store, queries};
use crate::subscription;

const FILE_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub async fn run(config: Config) -> anyhow::Result<()> {
	let shutdown = Shutdown::new();
	let token = shutdown.token();

	let store = Store::open(&config.paths.database).context("database initialization")?;
	let fleet = Arc::new(FleetClient::new(&config.v2ray_stat.nodes, DEFAULT_RPC_TIMEOUT)?);
	let records = fleet.records();
	store
		.high(move |conn| queries::replace_nodes(conn, &records))
		.await
		.context("seeding nodes table")?;
	let coordinator = Arc::new(Coordinator::new(fleet.clone(), store.clone()));

	let mut tasks: Vec<JoinHandle<()>> = Vec::new();

	let monitor = Monitor {
		fleet: fleet.clone(),
		store: store.clone(),
		interval: Duration::from_secs(config.v2ray_stat.monitor.ticker_interval),
		online_rate_threshold: config.v2ray_stat.monitor.online_rate_threshold,
	};
	tasks.extend(monitor.spawn(&token));

	let addr: SocketAddr = format!("{}:{}", config.v2ray_stat.address, config.v2ray_stat.port)
		.parse()
		.context("api listen address")?;
	let state = ApiState {
		store: store.clone(),
		coordinator: coordinator.clone(),
		config: Arc::new(config.clone()),
	};
	{
		let token = token.clone();
		tasks.push(tokio::spawn(async move {
			if let Err(e) = api::serve(state, addr, token).await {
				error!(err = %e, "api server failed");
			}
		}));
	}

	if let Some(sub) = &config.v2rs_sub {
		tasks.push(tokio::spawn(subscription::run(
			store.clone(),
			sub.endpoint(),
			token.clone(),
		)));
	}

	{
		let store = store.clone();
		let mut token = token.clone();
		tasks.push(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(FILE_SYNC_INTERVAL);
			// The interval fires immediately; the startup state is already
			// on disk, so skip that one.
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = ticker.tick() => {
						match store.sync_to_file().await {
							Ok(()) => debug!("file store synced"),
							Err(e) => warn!(err = %e, "periodic file sync failed"),
						}
					}
				}
			}
		}));
	}

	info!(nodes = config.v2ray_stat.nodes.len(), "backend started");
	shutdown.wait().await;
	info!("shutting down");

	if tokio::time::timeout(SHUTDOWN_DEADLINE, async {
		for task in tasks {
			let _ = task.await;
		}
	})
	.await
	.is_err()
	{
		warn!("some tasks did not stop within the deadline");
	}

	match tokio::time::timeout(SHUTDOWN_DEADLINE, store.sync_to_file()).await {
		Ok(Ok(())) => info!("final file sync complete"),
		Ok(Err(e)) => warn!(err = %e, "final file sync failed"),
		Err(_) => warn!("final file sync timed out"),
	}
	Ok(())
}
