//! Backend configuration. One YAML document, strongly typed, validated at
//! load; a failure here is fatal and exits with code 1.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use vstat_core::telemetry::{LogLevel, LogMode};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub log: LogConfig,
	#[serde(rename = "v2ray-stat")]
	pub v2ray_stat: BackendConfig,
	#[serde(default)]
	pub api: ApiConfig,
	#[serde(default = "default_timezone")]
	pub timezone: String,
	pub paths: Paths,
	#[serde(default)]
	pub stats_columns: StatsColumns,
	/// Where to dial the subscription service's DataStream; absent means the
	/// stream is not run.
	#[serde(rename = "v2rs-sub", default)]
	pub v2rs_sub: Option<SubEndpointConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
	#[serde(default)]
	pub loglevel: LogLevel,
	#[serde(default)]
	pub logmode: LogMode,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
	#[serde(default = "default_address")]
	pub address: String,
	pub port: u16,
	#[serde(default)]
	pub monitor: MonitorConfig,
	#[serde(default)]
	pub nodes: Vec<NodeConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
	/// Reconciliation tick, seconds.
	#[serde(default = "default_ticker_interval")]
	pub ticker_interval: u64,
	/// kbps at or above which a user counts as online; 0 means any traffic.
	#[serde(default)]
	pub online_rate_threshold: u64,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		MonitorConfig {
			ticker_interval: default_ticker_interval(),
			online_rate_threshold: 0,
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
	pub node_name: String,
	/// `http://host:port` for plaintext, `https://host:port` with mTLS.
	pub url: String,
	#[serde(default)]
	pub mtls: Option<MtlsConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MtlsConfig {
	pub cert: PathBuf,
	pub key: PathBuf,
	pub ca_cert: PathBuf,
	/// The fleet shares a self-signed CA without hostnames; SAN checks are
	/// skipped unless this is turned off.
	#[serde(default = "default_true")]
	pub insecure_skip_verify: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
	#[serde(default)]
	pub api_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Paths {
	pub database: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsColumns {
	#[serde(default = "StatsTableConfig::server_default")]
	pub server: StatsTableConfig,
	#[serde(default = "StatsTableConfig::client_default")]
	pub client: StatsTableConfig,
}

impl Default for StatsColumns {
	fn default() -> Self {
		StatsColumns {
			server: StatsTableConfig::server_default(),
			client: StatsTableConfig::client_default(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsTableConfig {
	/// e.g. "rate DESC"
	pub sort: String,
	pub columns: Vec<String>,
}

impl StatsTableConfig {
	fn server_default() -> StatsTableConfig {
		StatsTableConfig {
			sort: "rate DESC".to_string(),
			columns: ["node", "source", "rate", "uplink", "downlink", "sess_uplink", "sess_downlink"]
				.iter()
				.map(|s| s.to_string())
				.collect(),
		}
	}

	fn client_default() -> StatsTableConfig {
		StatsTableConfig {
			sort: "rate DESC".to_string(),
			columns: [
				"node",
				"user",
				"last_seen",
				"rate",
				"uplink",
				"downlink",
				"sess_uplink",
				"sess_downlink",
				"created",
			]
			.iter()
			.map(|s| s.to_string())
			.collect(),
		}
	}
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubEndpointConfig {
	pub address: String,
	pub grpc_port: u16,
	/// The subscription service's own HTTP port; accepted here so the same
	/// block can be pasted into both configs.
	#[serde(default)]
	pub port: Option<u16>,
}

impl SubEndpointConfig {
	pub fn endpoint(&self) -> String {
		format!("http://{}:{}", self.address, self.grpc_port)
	}
}

fn default_address() -> String {
	"127.0.0.1".to_string()
}

fn default_timezone() -> String {
	"UTC".to_string()
}

fn default_ticker_interval() -> u64 {
	10
}

fn default_true() -> bool {
	true
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
	let contents = std::fs::read_to_string(path)?;
	let config: Config = serde_yaml::from_str(&contents)?;
	validate(&config)?;
	Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
	if config.v2ray_stat.port == 0 {
		anyhow::bail!("v2ray-stat.port must be between 1 and 65535");
	}
	if config.v2ray_stat.monitor.ticker_interval < 1 {
		anyhow::bail!("v2ray-stat.monitor.ticker_interval must be at least 1");
	}
	let mut seen = std::collections::HashSet::new();
	for node in &config.v2ray_stat.nodes {
		if node.node_name.is_empty() {
			anyhow::bail!("node_name must not be empty");
		}
		if !seen.insert(node.node_name.as_str()) {
			anyhow::bail!("duplicate node_name {}", node.node_name);
		}
		let uri: http::Uri = node
			.url
			.parse()
			.map_err(|e| anyhow::anyhow!("node {} url: {e}", node.node_name))?;
		if uri.host().is_none() {
			anyhow::bail!("node {} url has no host", node.node_name);
		}
		if let Some(mtls) = &node.mtls {
			for (name, p) in [
				("cert", &mtls.cert),
				("key", &mtls.key),
				("ca_cert", &mtls.ca_cert),
			] {
				if !p.exists() {
					anyhow::bail!("node {} mtls.{name} does not exist: {}", node.node_name, p.display());
				}
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL: &str = r#"
v2ray-stat:
  port: 9952
  nodes:
    - node_name: nl-1
      url: http://203.0.113.7:50051
paths:
  database: /var/lib/v2ray-stat/data.db
"#;

	#[test]
	fn minimal_config_parses_with_defaults() {
		let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
		validate(&config).unwrap();
		assert_eq!(config.v2ray_stat.address, "127.0.0.1");
		assert_eq!(config.v2ray_stat.monitor.ticker_interval, 10);
		assert_eq!(config.timezone, "UTC");
		assert!(config.api.api_token.is_none());
		assert_eq!(config.stats_columns.client.sort, "rate DESC");
	}

	#[test]
	fn duplicate_node_names_are_rejected() {
		let yaml = r#"
v2ray-stat:
  port: 9952
  nodes:
    - {node_name: a, url: "http://10.0.0.1:1"}
    - {node_name: a, url: "http://10.0.0.2:1"}
paths:
  database: /tmp/db.db
"#;
		let config: Config = serde_yaml::from_str(yaml).unwrap();
		assert!(validate(&config).is_err());
	}

	#[test]
	fn zero_port_is_rejected() {
		let yaml = r#"
v2ray-stat:
  port: 0
paths:
  database: /tmp/db.db
"#;
		let config: Config = serde_yaml::from_str(yaml).unwrap();
		assert!(validate(&config).is_err());
	}
}
