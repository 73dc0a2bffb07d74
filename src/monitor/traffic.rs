//! Traffic loop: pull cumulative counters from every node, run the delta
//! accountant against the previous per-node snapshot, and upsert the
//! user/bound traffic rows. The first snapshot per node only seeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use vstat_core::accounting::{self, LastSeen, OnlineTracker, Snapshot};
use vstat_core::signal::ShutdownToken;
use vstat_proto::node::v1::{CounterEntry, Direction};

use crate::clock;
use crate::fleet::FleetClient;
use crate::store::queries::{self, TrafficUpsert};
use crate::store::Store;

pub async fn run(
	fleet: Arc<FleetClient>,
	store: Store,
	interval: Duration,
	online_rate_threshold: u64,
	mut token: ShutdownToken,
) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	let mut prev_user: HashMap<String, Snapshot> = HashMap::new();
	let mut prev_bound: HashMap<String, Snapshot> = HashMap::new();
	let mut trackers: HashMap<String, OnlineTracker> = HashMap::new();

	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			_ = ticker.tick() => {}
		}
		for handle in fleet.handles() {
			let node = handle.rec.name.clone();
			let response = match handle.get_traffic_stats().await {
				Ok(response) => response,
				Err(status) => {
					warn!(node = %node, err = %status.message(), "traffic pull failed");
					continue;
				},
			};
			let cur_user = to_snapshot(&response.user);
			let cur_bound = to_snapshot(&response.bound);

			// First pull after startup becomes the baseline; totals must
			// not be credited from it.
			if !prev_user.contains_key(&node) {
				debug!(node = %node, "seeded traffic baseline");
				prev_user.insert(node.clone(), cur_user);
				prev_bound.insert(node, cur_bound);
				continue;
			}

			let interval_secs = interval.as_secs();
			let user_acc = accounting::account(&prev_user[&node], &cur_user, interval_secs);
			let bound_acc = accounting::account(&prev_bound[&node], &cur_bound, interval_secs);

			let minute = clock::now_minute();
			let tracker = trackers.entry(node.clone()).or_default();
			let users: Vec<TrafficUpsert> = user_acc
				.into_iter()
				.map(|a| {
					let last_seen =
						match tracker.classify(&a.name, a.rate_bps, online_rate_threshold, &minute) {
							LastSeen::Online => Some("online".to_string()),
							LastSeen::WentOffline(ts) => Some(ts),
							LastSeen::Unchanged => None,
						};
					TrafficUpsert {
						name: a.name,
						delta_uplink: a.delta_uplink,
						delta_downlink: a.delta_downlink,
						sess_uplink: a.sess_uplink,
						sess_downlink: a.sess_downlink,
						rate_bps: a.rate_bps,
						last_seen,
					}
				})
				.collect();
			let bounds: Vec<TrafficUpsert> = bound_acc
				.into_iter()
				.map(|a| TrafficUpsert {
					name: a.name,
					delta_uplink: a.delta_uplink,
					delta_downlink: a.delta_downlink,
					sess_uplink: a.sess_uplink,
					sess_downlink: a.sess_downlink,
					rate_bps: a.rate_bps,
					last_seen: None,
				})
				.collect();

			let created = clock::now_hour();
			let write_node = node.clone();
			if let Err(e) = store
				.low(move |conn| queries::apply_traffic(conn, &write_node, &users, &bounds, &created))
				.await
			{
				warn!(node = %node, err = %e, "traffic upsert failed");
				// Keep the old snapshot so the missed deltas are credited
				// on the next successful tick.
				continue;
			}
			prev_user.insert(node.clone(), cur_user);
			prev_bound.insert(node, cur_bound);
		}
	}
}

fn to_snapshot(entries: &[CounterEntry]) -> Snapshot {
	entries
		.iter()
		.filter_map(|e| {
			let direction = match Direction::try_from(e.direction) {
				Ok(Direction::Uplink) => accounting::Direction::Uplink,
				Ok(Direction::Downlink) => accounting::Direction::Downlink,
				_ => return None,
			};
			Some(((e.name.clone(), direction), e.cumulative))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_conversion_skips_unspecified_direction() {
		let entries = vec![
			CounterEntry {
				name: "alice".into(),
				direction: Direction::Uplink as i32,
				cumulative: 10,
			},
			CounterEntry {
				name: "bob".into(),
				direction: Direction::Unspecified as i32,
				cumulative: 20,
			},
		];
		let snap = to_snapshot(&entries);
		assert_eq!(snap.len(), 1);
		assert_eq!(snap[&("alice".to_string(), accounting::Direction::Uplink)], 10);
	}
}
