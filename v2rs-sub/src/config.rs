//! Subscription-service configuration: listen addresses plus the
//! subscription tree. Profiles merge field-wise: defaults, then the user's
//! group, then the user's own overrides.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use vstat_core::telemetry::{LogLevel, LogMode};

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub log: LogConfig,
	#[serde(rename = "v2rs-sub")]
	pub service: ServiceConfig,
	#[serde(default)]
	pub subscription: SubscriptionTree,
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
pub struct ServiceConfig {
	#[serde(default = "default_address")]
	pub address: String,
	/// Subscription HTTP endpoint.
	pub port: u16,
	/// Where the backend dials the DataStream.
	pub grpc_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionTree {
	#[serde(default)]
	pub defaults: Profile,
	#[serde(default)]
	pub groups: BTreeMap<String, Profile>,
	#[serde(default)]
	pub users: BTreeMap<String, UserProfile>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
	/// Allowed client protocols, e.g. ["vless", "trojan"]. Absent = all.
	#[serde(default)]
	pub clients: Option<Vec<String>>,
	/// Node filter. Absent = all nodes.
	#[serde(default)]
	pub nodes: Option<Vec<String>>,
	/// Per-protocol URI templates.
	#[serde(default)]
	pub templates: Option<BTreeMap<String, String>>,
	/// Extra response headers for the bundle.
	#[serde(default)]
	pub headers: Option<BTreeMap<String, String>>,
}

// No deny_unknown_fields here: serde cannot combine it with flatten.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserProfile {
	#[serde(default)]
	pub group: Option<String>,
	#[serde(flatten)]
	pub profile: Profile,
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedProfile {
	pub clients: Option<Vec<String>>,
	pub nodes: Option<Vec<String>>,
	pub templates: BTreeMap<String, String>,
	pub headers: BTreeMap<String, String>,
}

impl SubscriptionTree {
	pub fn resolve(&self, user: &str) -> ResolvedProfile {
		let mut layers: Vec<&Profile> = vec![&self.defaults];
		if let Some(user_profile) = self.users.get(user) {
			if let Some(group) = &user_profile.group {
				if let Some(group_profile) = self.groups.get(group) {
					layers.push(group_profile);
				}
			}
			layers.push(&user_profile.profile);
		}

		let mut resolved = ResolvedProfile::default();
		for layer in layers {
			if let Some(clients) = &layer.clients {
				resolved.clients = Some(clients.clone());
			}
			if let Some(nodes) = &layer.nodes {
				resolved.nodes = Some(nodes.clone());
			}
			if let Some(templates) = &layer.templates {
				resolved.templates = templates.clone();
			}
			if let Some(headers) = &layer.headers {
				resolved.headers = headers.clone();
			}
		}
		resolved
	}
}

fn default_address() -> String {
	"127.0.0.1".to_string()
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
	let contents = std::fs::read_to_string(path)?;
	let config: Config = serde_yaml::from_str(&contents)?;
	validate(&config)?;
	Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
	if config.service.port == 0 || config.service.grpc_port == 0 {
		anyhow::bail!("v2rs-sub.port and v2rs-sub.grpc_port must be between 1 and 65535");
	}
	if config.service.port == config.service.grpc_port {
		anyhow::bail!("v2rs-sub.port and v2rs-sub.grpc_port must differ");
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	const YAML: &str = r#"
v2rs-sub:
  port: 8081
  grpc_port: 9955
subscription:
  defaults:
    clients: [vless, trojan]
    headers:
      profile-update-interval: "12"
  groups:
    premium:
      nodes: [nl-1, de-1]
  users:
    alice:
      group: premium
      clients: [vless]
"#;

	#[test]
	fn profiles_merge_defaults_group_user() {
		let config: Config = serde_yaml::from_str(YAML).unwrap();
		let alice = config.subscription.resolve("alice");
		assert_eq!(alice.clients, Some(vec!["vless".to_string()]));
		assert_eq!(alice.nodes, Some(vec!["nl-1".to_string(), "de-1".to_string()]));
		assert_eq!(alice.headers["profile-update-interval"], "12");

		let other = config.subscription.resolve("bob");
		assert_eq!(other.clients, Some(vec!["vless".to_string(), "trojan".to_string()]));
		assert_eq!(other.nodes, None);
	}

	#[test]
	fn colliding_ports_are_rejected() {
		let yaml = "v2rs-sub:\n  port: 9955\n  grpc_port: 9955\n";
		let config: Config = serde_yaml::from_str(yaml).unwrap();
		assert!(validate(&config).is_err());
	}
}
