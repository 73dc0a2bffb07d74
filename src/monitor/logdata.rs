//! Log loop: DNS counts are increment-added into the store; observed IPs
//! live in a node-local TTL map and the users table always carries the
//! currently-live union across nodes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;
use vstat_core::signal::ShutdownToken;

use crate::fleet::FleetClient;
use crate::store::Store;
use crate::store::queries;

/// An IP not re-observed within this window drops out of the user's set.
const IP_TTL: Duration = Duration::from_secs(66);

type SeenMap = HashMap<(String, String), Instant>; // (node, ip) → last seen

pub async fn run(fleet: Arc<FleetClient>, store: Store, interval: Duration, mut token: ShutdownToken) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	let mut ip_seen: HashMap<String, SeenMap> = HashMap::new();
	let mut last_written: HashMap<String, String> = HashMap::new();

	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			_ = ticker.tick() => {}
		}
		for handle in fleet.handles() {
			let node = handle.rec.name.clone();
			let response = match handle.get_log_data().await {
				Ok(response) => response,
				Err(status) => {
					warn!(node = %node, err = %status.message(), "log pull failed");
					continue;
				},
			};
			let now = Instant::now();
			let mut dns: Vec<(String, Vec<(String, u64)>)> = Vec::new();
			for (user, data) in response.users {
				let seen = ip_seen.entry(user.clone()).or_default();
				for ip in data.ips {
					seen.insert((node.clone(), ip), now);
				}
				if !data.dns_counts.is_empty() {
					dns.push((user, data.dns_counts.into_iter().collect()));
				}
			}
			if !dns.is_empty() {
				let write_node = node.clone();
				if let Err(e) = store
					.low(move |conn| queries::add_dns(conn, &write_node, &dns))
					.await
				{
					warn!(node = %node, err = %e, "dns merge failed");
				}
			}
		}

		// Expire and rewrite only the sets that actually changed.
		let now = Instant::now();
		let mut writes: Vec<(String, String)> = Vec::new();
		for (user, seen) in &mut ip_seen {
			let joined = live_ips(seen, now);
			if last_written.get(user) != Some(&joined) {
				writes.push((user.clone(), joined.clone()));
				last_written.insert(user.clone(), joined);
			}
		}
		ip_seen.retain(|_, seen| !seen.is_empty());
		for (user, ips) in writes {
			if let Err(e) = store
				.low(move |conn| queries::set_user_ips(conn, &user, &ips))
				.await
			{
				warn!(err = %e, "ip set write failed");
			}
		}
	}
}

/// Prunes expired entries and renders the live set, sorted and
/// comma-joined, deduplicated across nodes.
fn live_ips(seen: &mut SeenMap, now: Instant) -> String {
	seen.retain(|_, t| now.duration_since(*t) <= IP_TTL);
	let mut ips: Vec<&str> = seen.keys().map(|(_, ip)| ip.as_str()).collect();
	ips.sort_unstable();
	ips.dedup();
	ips.join(",")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ips_expire_after_ttl() {
		let base = Instant::now();
		let mut seen = SeenMap::new();
		seen.insert(("n1".into(), "10.0.0.1".into()), base);
		seen.insert(("n1".into(), "10.0.0.2".into()), base);

		// t=60: ip .1 re-observed.
		seen.insert(("n1".into(), "10.0.0.1".into()), base + Duration::from_secs(60));

		// t=70: .2 is 70s old (expired), .1 is 10s old.
		let live = live_ips(&mut seen, base + Duration::from_secs(70));
		assert_eq!(live, "10.0.0.1");
	}

	#[test]
	fn same_ip_on_two_nodes_dedupes() {
		let base = Instant::now();
		let mut seen = SeenMap::new();
		seen.insert(("n1".into(), "10.0.0.1".into()), base);
		seen.insert(("n2".into(), "10.0.0.1".into()), base);
		assert_eq!(live_ips(&mut seen, base), "10.0.0.1");
	}
}
