use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter, fmt};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
	None,
	Error,
	Warn,
	#[default]
	Info,
	Debug,
	Trace,
}

/// Inclusive keeps everything at the configured level and above; exclusive
/// keeps only events at exactly the configured level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
	#[default]
	Inclusive,
	Exclusive,
}

impl LogLevel {
	fn as_filter(self) -> LevelFilter {
		match self {
			LogLevel::None => LevelFilter::OFF,
			LogLevel::Error => LevelFilter::ERROR,
			LogLevel::Warn => LevelFilter::WARN,
			LogLevel::Info => LevelFilter::INFO,
			LogLevel::Debug => LevelFilter::DEBUG,
			LogLevel::Trace => LevelFilter::TRACE,
		}
	}
}

/// Install the global subscriber. Logs go to stderr without ANSI, matching
/// how the binaries are run under systemd.
pub fn init(level: LogLevel, mode: LogMode) {
	let fmt = fmt::layer().with_writer(std::io::stderr).with_ansi(false);
	let registry = tracing_subscriber::registry().with(fmt);
	match mode {
		LogMode::Inclusive => registry.with(level.as_filter()).init(),
		LogMode::Exclusive => {
			let only = level.as_filter();
			registry
				.with(filter::filter_fn(move |meta| {
					LevelFilter::from_level(*meta.level()) == only
				}))
				.init()
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn level_parses_from_yaml() {
		let lvl: LogLevel = serde_yaml::from_str("debug").unwrap();
		assert_eq!(lvl, LogLevel::Debug);
		let mode: LogMode = serde_yaml::from_str("exclusive").unwrap();
		assert_eq!(mode, LogMode::Exclusive);
	}

	#[test]
	fn none_maps_to_off() {
		assert_eq!(LogLevel::None.as_filter(), LevelFilter::OFF);
	}
}
