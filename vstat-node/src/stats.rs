//! Client for the proxy core's stats API and the counter-name parsing
//! shared with it. Counter names come back in the form
//! `user>>>alice>>>traffic>>>uplink` or `inbound>>>vless-in>>>traffic>>>downlink`;
//! internal counters (api, block) are filtered out before classification.

use tonic::transport::{Channel, Endpoint};
use vstat_proto::node::v1::{CounterEntry, Direction};
use vstat_proto::xray::stats::stats_service_client::StatsServiceClient;
use vstat_proto::xray::stats::QueryStatsRequest;

const SEPARATOR: &str = ">>>";

#[derive(Clone, Debug, Default)]
pub struct TrafficSnapshot {
	pub bound: Vec<CounterEntry>,
	pub user: Vec<CounterEntry>,
}

#[derive(Clone)]
pub struct StatsClient {
	client: StatsServiceClient<Channel>,
}

impl StatsClient {
	/// The channel is lazy; the core being down only fails the calls.
	pub fn new(address: &str) -> Result<StatsClient, tonic::transport::Error> {
		let channel = Endpoint::from_shared(address.to_string())?.connect_lazy();
		Ok(StatsClient {
			client: StatsServiceClient::new(channel),
		})
	}

	pub async fn query(&self) -> Result<TrafficSnapshot, tonic::Status> {
		let response = self
			.client
			.clone()
			.query_stats(QueryStatsRequest {
				pattern: String::new(),
				reset: false,
			})
			.await?
			.into_inner();

		let mut snapshot = TrafficSnapshot::default();
		for stat in response.stat {
			let Some((kind, entry)) = parse_counter(&stat.name, stat.value) else {
				continue;
			};
			match kind {
				CounterKind::User => snapshot.user.push(entry),
				CounterKind::Bound => snapshot.bound.push(entry),
			}
		}
		Ok(snapshot)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterKind {
	Bound,
	User,
}

/// Split a core counter name into its classification, target and direction.
/// Returns `None` for internal counters and anything malformed.
pub fn parse_counter(name: &str, value: i64) -> Option<(CounterKind, CounterEntry)> {
	if name.contains("api") || name.contains("block") {
		return None;
	}
	let parts: Vec<&str> = name.split(SEPARATOR).collect();
	if parts.len() < 4 {
		return None;
	}
	let kind = match parts[0] {
		"user" => CounterKind::User,
		"inbound" | "outbound" => CounterKind::Bound,
		_ => return None,
	};
	let direction = match parts[3] {
		"uplink" => Direction::Uplink,
		"downlink" => Direction::Downlink,
		_ => return None,
	};
	Some((
		kind,
		CounterEntry {
			name: parts[1].to_string(),
			direction: direction as i32,
			cumulative: value.max(0) as u64,
		},
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_counter_parses() {
		let (kind, entry) = parse_counter("user>>>alice>>>traffic>>>uplink", 42).unwrap();
		assert_eq!(kind, CounterKind::User);
		assert_eq!(entry.name, "alice");
		assert_eq!(entry.direction, Direction::Uplink as i32);
		assert_eq!(entry.cumulative, 42);
	}

	#[test]
	fn inbound_and_outbound_are_bound() {
		let (kind, entry) = parse_counter("inbound>>>vless-in>>>traffic>>>downlink", 7).unwrap();
		assert_eq!(kind, CounterKind::Bound);
		assert_eq!(entry.name, "vless-in");
		let (kind, _) = parse_counter("outbound>>>direct>>>traffic>>>uplink", 7).unwrap();
		assert_eq!(kind, CounterKind::Bound);
	}

	#[test]
	fn internal_counters_are_filtered() {
		assert!(parse_counter("inbound>>>api>>>traffic>>>uplink", 1).is_none());
		assert!(parse_counter("outbound>>>block>>>traffic>>>downlink", 1).is_none());
	}

	#[test]
	fn malformed_names_are_dropped() {
		assert!(parse_counter("user>>>alice", 1).is_none());
		assert!(parse_counter("memory", 1).is_none());
		assert!(parse_counter("user>>>alice>>>traffic>>>sideways", 1).is_none());
	}

	#[test]
	fn negative_counters_clamp_to_zero() {
		let (_, entry) = parse_counter("user>>>alice>>>traffic>>>uplink", -5).unwrap();
		assert_eq!(entry.cumulative, 0);
	}
}
