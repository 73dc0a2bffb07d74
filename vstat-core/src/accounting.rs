//! Delta accounting over the proxy core's monotonic counters.
//!
//! The proxy core only ever exposes cumulative uplink/downlink counters.
//! Each reconciliation tick the caller hands us the previous and current
//! snapshot for one node and gets back per-name deltas, session counters,
//! and a rate for the interval. The functions here are pure; all state
//! (snapshots, the active-user set) is owned by the caller.

use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
	Uplink,
	Downlink,
}

/// Cumulative counters as read from the proxy core, keyed by
/// `(name, direction)` where name is a user or an inbound/outbound tag.
pub type Snapshot = HashMap<(String, Direction), u64>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Accounted {
	pub name: String,
	pub delta_uplink: u64,
	pub delta_downlink: u64,
	pub sess_uplink: u64,
	pub sess_downlink: u64,
	pub rate_bps: u64,
}

/// Turn two snapshots into per-name interval accounting.
///
/// A `(name, direction)` pair absent from `prev` is seeded: its session
/// counter is taken from `cur` and no delta is credited. A name absent from
/// `cur` but present in `prev` reports zeroed session counters (the core
/// reset its connection accounting). Counter regressions clamp to zero.
pub fn account(prev: &Snapshot, cur: &Snapshot, interval_secs: u64) -> Vec<Accounted> {
	let names: BTreeSet<&String> = prev.keys().chain(cur.keys()).map(|(n, _)| n).collect();
	let interval = interval_secs.max(1);

	names
		.into_iter()
		.map(|name| {
			let read = |snap: &Snapshot, dir| snap.get(&(name.clone(), dir)).copied();
			let cur_up = read(cur, Direction::Uplink);
			let cur_down = read(cur, Direction::Downlink);
			let prev_up = read(prev, Direction::Uplink);
			let prev_down = read(prev, Direction::Downlink);

			let delta = |c: Option<u64>, p: Option<u64>| match (c, p) {
				(Some(c), Some(p)) => c.saturating_sub(p),
				// First observation of this pair: seed only.
				_ => 0,
			};
			let delta_uplink = delta(cur_up, prev_up);
			let delta_downlink = delta(cur_down, prev_down);

			Accounted {
				name: name.clone(),
				delta_uplink,
				delta_downlink,
				sess_uplink: cur_up.unwrap_or(0),
				sess_downlink: cur_down.unwrap_or(0),
				rate_bps: (delta_uplink + delta_downlink) * 8 / interval,
			}
		})
		.collect()
}

/// Outcome of the last-seen policy for one user on one tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LastSeen {
	/// Rate at or above the threshold; the row reads `online`.
	Online,
	/// The user just dropped below the threshold; record this minute once.
	WentOffline(String),
	/// Still offline; the stored value stays as it is.
	Unchanged,
}

/// Tracks which users were online on the previous tick so the offline
/// timestamp is written exactly once. One tracker per node.
#[derive(Debug, Default)]
pub struct OnlineTracker {
	active: HashSet<String>,
}

impl OnlineTracker {
	/// `threshold_kbps == 0` classifies any nonzero rate as online.
	pub fn classify(
		&mut self,
		user: &str,
		rate_bps: u64,
		threshold_kbps: u64,
		minute: &str,
	) -> LastSeen {
		let online = if threshold_kbps == 0 {
			rate_bps > 0
		} else {
			rate_bps >= threshold_kbps * 1000
		};
		if online {
			self.active.insert(user.to_string());
			LastSeen::Online
		} else if self.active.remove(user) {
			LastSeen::WentOffline(minute.to_string())
		} else {
			LastSeen::Unchanged
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn snap(entries: &[(&str, Direction, u64)]) -> Snapshot {
		entries
			.iter()
			.map(|(n, d, v)| ((n.to_string(), *d), *v))
			.collect()
	}

	#[test]
	fn first_tick_seeds_without_deltas() {
		let prev = Snapshot::new();
		let cur = snap(&[("alice", Direction::Uplink, 1_000_000)]);
		let out = account(&prev, &cur, 10);
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].delta_uplink, 0);
		assert_eq!(out[0].rate_bps, 0);
		assert_eq!(out[0].sess_uplink, 1_000_000);
	}

	#[test]
	fn second_tick_credits_delta_and_rate() {
		let prev = snap(&[("alice", Direction::Uplink, 1_000_000)]);
		let cur = snap(&[("alice", Direction::Uplink, 1_300_000)]);
		let out = account(&prev, &cur, 10);
		assert_eq!(out[0].delta_uplink, 300_000);
		// (300000 * 8) / 10
		assert_eq!(out[0].rate_bps, 240_000);
		assert_eq!(out[0].sess_uplink, 1_300_000);
	}

	#[test]
	fn counter_regression_clamps_to_zero() {
		let prev = snap(&[("alice", Direction::Downlink, 5_000)]);
		let cur = snap(&[("alice", Direction::Downlink, 700)]);
		let out = account(&prev, &cur, 10);
		assert_eq!(out[0].delta_downlink, 0);
		assert_eq!(out[0].sess_downlink, 700);
	}

	#[test]
	fn vanished_name_zeroes_session_counters() {
		let prev = snap(&[
			("alice", Direction::Uplink, 100),
			("alice", Direction::Downlink, 200),
		]);
		let cur = Snapshot::new();
		let out = account(&prev, &cur, 10);
		assert_eq!(out[0].sess_uplink, 0);
		assert_eq!(out[0].sess_downlink, 0);
		assert_eq!(out[0].delta_uplink, 0);
	}

	#[test]
	fn rate_sums_both_directions() {
		let prev = snap(&[
			("alice", Direction::Uplink, 0),
			("alice", Direction::Downlink, 0),
		]);
		let cur = snap(&[
			("alice", Direction::Uplink, 500),
			("alice", Direction::Downlink, 1_000),
		]);
		let out = account(&prev, &cur, 4);
		assert_eq!(out[0].rate_bps, 1_500 * 8 / 4);
	}

	#[test]
	fn zero_threshold_counts_any_rate_as_online() {
		let mut tracker = OnlineTracker::default();
		assert_eq!(tracker.classify("u", 1, 0, "12:00"), LastSeen::Online);
		assert_eq!(
			tracker.classify("u", 0, 0, "12:01"),
			LastSeen::WentOffline("12:01".into())
		);
	}

	#[test]
	fn offline_timestamp_is_sticky() {
		let mut tracker = OnlineTracker::default();
		assert_eq!(tracker.classify("u", 200_000, 100, "12:00"), LastSeen::Online);
		assert_eq!(
			tracker.classify("u", 0, 100, "12:01"),
			LastSeen::WentOffline("12:01".into())
		);
		// Below threshold again: the stored value must not move.
		assert_eq!(tracker.classify("u", 0, 100, "12:02"), LastSeen::Unchanged);
		// Threshold is kbps, rate is bps.
		assert_eq!(tracker.classify("u", 99_999, 100, "12:03"), LastSeen::Unchanged);
		assert_eq!(tracker.classify("u", 100_000, 100, "12:04"), LastSeen::Online);
	}
}
