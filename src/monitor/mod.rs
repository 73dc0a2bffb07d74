//! The three reconciliation loops. Each is an independent ticker-driven
//! task; within a loop the nodes are visited one at a time, and all work
//! for one node in one tick lands in a single store transaction.

pub mod logdata;
pub mod traffic;
pub mod users;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use vstat_core::signal::ShutdownToken;

use crate::fleet::FleetClient;
use crate::store::Store;

pub struct Monitor {
	pub fleet: Arc<FleetClient>,
	pub store: Store,
	pub interval: Duration,
	pub online_rate_threshold: u64,
}

impl Monitor {
	pub fn spawn(self, token: &ShutdownToken) -> Vec<JoinHandle<()>> {
		vec![
			tokio::spawn(traffic::run(
				self.fleet.clone(),
				self.store.clone(),
				self.interval,
				self.online_rate_threshold,
				token.clone(),
			)),
			tokio::spawn(users::run(
				self.fleet.clone(),
				self.store.clone(),
				self.interval,
				token.clone(),
			)),
			tokio::spawn(logdata::run(
				self.fleet.clone(),
				self.store.clone(),
				self.interval,
				token.clone(),
			)),
		]
	}
}
