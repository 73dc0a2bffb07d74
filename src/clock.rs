//! Wall-clock formatting. All human-facing timestamps are rendered in the
//! configured timezone, which `app::run` exports as `TZ` before the runtime
//! starts, so `chrono::Local` is already the right zone here.

use chrono::Local;

/// Current time truncated to the minute, e.g. `2026-08-01 12:34`.
/// Written into `last_seen` when a user drops offline.
pub fn now_minute() -> String {
	Local::now().format("%Y-%m-%d %H:%M").to_string()
}

/// Current time truncated to the hour, e.g. `2026-08-01 12:00`.
/// Written into `created` when a user row is first committed.
pub fn now_hour() -> String {
	Local::now().format("%Y-%m-%d %H:00").to_string()
}

pub fn now_unix() -> i64 {
	Local::now().timestamp()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minute_format_has_no_seconds() {
		let s = now_minute();
		// YYYY-MM-DD HH:MM
		assert_eq!(s.len(), 16);
	}

	#[test]
	fn hour_format_zeroes_minutes() {
		assert!(now_hour().ends_with(":00"));
	}
}
