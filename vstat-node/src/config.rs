use std::path::{Path, PathBuf};

use serde::Deserialize;
use vstat_core::telemetry::{LogLevel, LogMode};

// Matches the Xray access log:
//   from 203.0.113.7:51332 accepted tcp:example.com:443 [vless-in] email: alice
const DEFAULT_ACCESS_LOG_REGEX: &str =
	r"from (\S+?):\d+ accepted \w+:([\w.\-]+):\d+.*email: (\S+)";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub log: LogConfig,
	pub agent: AgentConfig,
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
pub struct AgentConfig {
	#[serde(default = "default_address")]
	pub address: String,
	pub port: u16,
	/// Proxy-core config file this agent owns.
	pub core_config: PathBuf,
	/// gRPC endpoint of the proxy core's stats API.
	pub core_api_address: String,
	pub access_log: PathBuf,
	#[serde(default = "default_access_log_regex")]
	pub access_log_regex: String,
	/// Optional command run after a config mutation, e.g. "systemctl restart xray".
	#[serde(default)]
	pub restart_command: Option<String>,
	#[serde(default)]
	pub auth_lua: Option<AuthLuaConfig>,
	#[serde(default)]
	pub mtls: Option<MtlsConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthLuaConfig {
	pub path: PathBuf,
	#[serde(default)]
	pub restart_command: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MtlsConfig {
	pub cert: PathBuf,
	pub key: PathBuf,
	pub ca_cert: PathBuf,
}

fn default_address() -> String {
	"0.0.0.0".to_string()
}

fn default_access_log_regex() -> String {
	DEFAULT_ACCESS_LOG_REGEX.to_string()
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
	let contents = std::fs::read_to_string(path)?;
	let config: Config = serde_yaml::from_str(&contents)?;
	if config.agent.port == 0 {
		anyhow::bail!("agent.port must be between 1 and 65535");
	}
	regex::Regex::new(&config.agent.access_log_regex)
		.map_err(|e| anyhow::anyhow!("invalid access_log_regex: {e}"))?;
	if let Some(mtls) = &config.agent.mtls {
		for (name, p) in [
			("cert", &mtls.cert),
			("key", &mtls.key),
			("ca_cert", &mtls.ca_cert),
		] {
			if !p.exists() {
				anyhow::bail!("mtls.{name} does not exist: {}", p.display());
			}
		}
	}
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn minimal_config_parses_with_defaults() {
		let yaml = r#"
agent:
  port: 50051
  core_config: /etc/xray/config.json
  core_api_address: http://127.0.0.1:10085
  access_log: /var/log/xray/access.log
"#;
		let config: Config = serde_yaml::from_str(yaml).unwrap();
		assert_eq!(config.agent.address, "0.0.0.0");
		assert_eq!(config.log.loglevel, LogLevel::Info);
		assert!(config.agent.auth_lua.is_none());
	}

	#[test]
	fn default_regex_matches_access_log_line() {
		let re = regex::Regex::new(DEFAULT_ACCESS_LOG_REGEX).unwrap();
		let caps = re
			.captures("2026/08/01 10:00:01 from 203.0.113.7:51332 accepted tcp:example.com:443 [vless-in] email: alice")
			.unwrap();
		assert_eq!(&caps[1], "203.0.113.7");
		assert_eq!(&caps[2], "example.com");
		assert_eq!(&caps[3], "alice");
	}
}
