//! User loop: each node's configured user list becomes the store's view of
//! that node. Missing users are inserted, users the node no longer has are
//! deleted, credentials are upserted.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use vstat_core::signal::ShutdownToken;

use crate::clock;
use crate::fleet::FleetClient;
use crate::store::queries::{self, NodeUserSync};
use crate::store::Store;

pub async fn run(fleet: Arc<FleetClient>, store: Store, interval: Duration, mut token: ShutdownToken) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			_ = ticker.tick() => {}
		}
		for handle in fleet.handles() {
			let node = handle.rec.name.clone();
			let response = match handle.list_users().await {
				Ok(response) => response,
				Err(status) => {
					warn!(node = %node, err = %status.message(), "user pull failed");
					continue;
				},
			};
			let users: Vec<NodeUserSync> = response
				.users
				.into_iter()
				.map(|u| NodeUserSync {
					user: u.user,
					credentials: u
						.credentials
						.into_iter()
						.map(|c| (c.inbound_tag, c.id))
						.collect(),
				})
				.collect();
			let created = clock::now_hour();
			let write_node = node.clone();
			if let Err(e) = store
				.low(move |conn| queries::apply_user_sync(conn, &write_node, &users, &created))
				.await
			{
				warn!(node = %node, err = %e, "user sync failed");
			}
		}
	}
}
