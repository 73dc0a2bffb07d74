//! Mutation of the proxy core's JSON config file.
//!
//! The agent is the only writer of this file. Every mutation follows the
//! same pipeline: parse, mutate the in-memory document, pretty-print, write
//! to a temp file, rename over the original. Unknown fields are preserved
//! because the document is handled as raw JSON, never as typed structs.
//!
//! Disabled users are moved out of the live config into a sidecar store
//! next to it, keyed by inbound tag, so the core stops serving them while
//! their credentials survive for re-enabling.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use uuid::Uuid;

const DISABLED_STORE: &str = ".disabled_users.json";
const TROJAN_PASSWORD_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
	#[error("inbound {0} not found")]
	InboundNotFound(String),
	#[error("inbound {tag} has unsupported protocol {protocol}")]
	UnsupportedProtocol { tag: String, protocol: String },
	#[error("user {0} already exists")]
	AlreadyExists(String),
	#[error("credential collision for user {0}")]
	CredentialCollision(String),
	#[error("user {0} not found")]
	NotFound(String),
	#[error("config parse: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
	Vless,
	Trojan,
}

impl Protocol {
	fn from_str(s: &str) -> Option<Protocol> {
		match s {
			"vless" => Some(Protocol::Vless),
			"trojan" => Some(Protocol::Trojan),
			_ => None,
		}
	}

	fn credential_key(self) -> &'static str {
		match self {
			Protocol::Vless => "id",
			Protocol::Trojan => "password",
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Protocol::Vless => "vless",
			Protocol::Trojan => "trojan",
		})
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListedUser {
	pub name: String,
	pub enabled: bool,
	/// `(inbound_tag, credential)` pairs.
	pub credentials: Vec<(String, String)>,
	pub sub_end: i64,
	pub traffic_cap: i64,
}

#[derive(Clone, Debug)]
pub struct AddOutcome {
	pub protocol: Protocol,
	/// `(user, credential)` in request order.
	pub credentials: Vec<(String, String)>,
}

type DisabledStore = HashMap<String, Vec<Value>>;

pub struct CoreConfig {
	path: PathBuf,
	disabled_path: PathBuf,
}

impl CoreConfig {
	pub fn new(path: impl Into<PathBuf>) -> CoreConfig {
		let path = path.into();
		let disabled_path = path.with_file_name(DISABLED_STORE);
		CoreConfig {
			path,
			disabled_path,
		}
	}

	fn load(&self) -> Result<Value, CoreError> {
		let contents = std::fs::read_to_string(&self.path)?;
		Ok(serde_json::from_str(&contents)?)
	}

	// Pretty-printed write-replace. The temp file lives in the same
	// directory so the rename cannot cross filesystems.
	fn store(&self, doc: &Value) -> Result<(), CoreError> {
		write_replace(&self.path, &serde_json::to_string_pretty(doc)?)
	}

	fn load_disabled(&self) -> Result<DisabledStore, CoreError> {
		match std::fs::read_to_string(&self.disabled_path) {
			Ok(contents) => Ok(serde_json::from_str(&contents)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DisabledStore::new()),
			Err(e) => Err(e.into()),
		}
	}

	fn store_disabled(&self, store: &DisabledStore) -> Result<(), CoreError> {
		write_replace(&self.disabled_path, &serde_json::to_string_pretty(store)?)
	}

	pub fn protocol_of(&self, inbound_tag: &str) -> Result<Protocol, CoreError> {
		let doc = self.load()?;
		inbound_protocol(&doc, inbound_tag)
	}

	pub fn list_users(&self) -> Result<Vec<ListedUser>, CoreError> {
		let doc = self.load()?;
		let disabled = self.load_disabled()?;
		let mut users: HashMap<String, ListedUser> = HashMap::new();

		let mut absorb = |tag: &str, client: &Value, enabled: bool| {
			let Some(name) = client_name(client) else {
				return;
			};
			let entry = users.entry(name.to_string()).or_insert_with(|| ListedUser {
				name: name.to_string(),
				enabled: false,
				credentials: Vec::new(),
				sub_end: 0,
				traffic_cap: 0,
			});
			entry.enabled |= enabled;
			if let Some(cred) = client_credential(client) {
				entry.credentials.push((tag.to_string(), cred.to_string()));
			}
			if entry.sub_end == 0 {
				entry.sub_end = client["subEnd"].as_i64().unwrap_or(0);
			}
			if entry.traffic_cap == 0 {
				entry.traffic_cap = client["trafficCap"].as_i64().unwrap_or(0);
			}
		};

		for (tag, _protocol, clients) in user_inbounds(&doc) {
			for client in clients {
				absorb(tag, client, true);
			}
		}
		for (tag, clients) in &disabled {
			for client in clients {
				absorb(tag.as_str(), client, false);
			}
		}

		let mut out: Vec<ListedUser> = users.into_values().collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(out)
	}

	/// All-or-nothing: if any username (or generated credential) collides on
	/// the inbound, nothing is written.
	pub fn add_users(
		&self,
		usernames: &[String],
		inbound_tag: &str,
	) -> Result<AddOutcome, CoreError> {
		let mut doc = self.load()?;
		let disabled = self.load_disabled()?;
		let protocol = inbound_protocol(&doc, inbound_tag)?;

		let mut existing_names: Vec<String> = Vec::new();
		let mut existing_creds: Vec<String> = Vec::new();
		{
			let clients = inbound_clients(&doc, inbound_tag).unwrap_or_default();
			let parked = disabled.get(inbound_tag).map(|v| v.as_slice()).unwrap_or(&[]);
			for client in clients.iter().copied().chain(parked.iter()) {
				if let Some(name) = client_name(client) {
					existing_names.push(name.to_string());
				}
				if let Some(cred) = client_credential(client) {
					existing_creds.push(cred.to_string());
				}
			}
		}

		let mut outcome = AddOutcome {
			protocol,
			credentials: Vec::with_capacity(usernames.len()),
		};
		for name in usernames {
			if existing_names.iter().any(|n| n == name) {
				return Err(CoreError::AlreadyExists(name.clone()));
			}
			let credential = match protocol {
				Protocol::Vless => Uuid::new_v4().to_string(),
				Protocol::Trojan => rand::rng()
					.sample_iter(Alphanumeric)
					.take(TROJAN_PASSWORD_LEN)
					.map(char::from)
					.collect(),
			};
			if existing_creds.iter().any(|c| *c == credential) {
				return Err(CoreError::CredentialCollision(name.clone()));
			}
			existing_creds.push(credential.clone());
			outcome.credentials.push((name.clone(), credential));
		}

		let clients = inbound_clients_mut(&mut doc, inbound_tag)?;
		for (name, credential) in &outcome.credentials {
			clients.push(json!({
				"email": name,
				(protocol.credential_key()): credential,
			}));
		}
		self.store(&doc)?;
		Ok(outcome)
	}

	/// Symmetric to add: every requested user must exist on the inbound
	/// (live or disabled) or nothing is removed.
	pub fn delete_users(
		&self,
		usernames: &[String],
		inbound_tag: &str,
	) -> Result<Vec<(String, String)>, CoreError> {
		let mut doc = self.load()?;
		let mut disabled = self.load_disabled()?;
		inbound_protocol(&doc, inbound_tag)?;

		let live_names: Vec<String> = inbound_clients(&doc, inbound_tag)
			.unwrap_or_default()
			.iter()
			.filter_map(|c| client_name(c).map(str::to_string))
			.collect();
		let parked_names: Vec<String> = disabled
			.get(inbound_tag)
			.map(|v| {
				v.iter()
					.filter_map(|c| client_name(c).map(str::to_string))
					.collect()
			})
			.unwrap_or_default();
		for name in usernames {
			if !live_names.contains(name) && !parked_names.contains(name) {
				return Err(CoreError::NotFound(name.clone()));
			}
		}

		let mut removed = Vec::new();
		let clients = inbound_clients_mut(&mut doc, inbound_tag)?;
		clients.retain(|client| {
			let matched = client_name(client).is_some_and(|n| usernames.iter().any(|u| u == n));
			if matched {
				if let (Some(name), Some(cred)) = (client_name(client), client_credential(client)) {
					removed.push((name.to_string(), cred.to_string()));
				}
			}
			!matched
		});
		if let Some(parked) = disabled.get_mut(inbound_tag) {
			parked.retain(|client| {
				let matched = client_name(client).is_some_and(|n| usernames.iter().any(|u| u == n));
				if matched {
					if let (Some(name), Some(cred)) = (client_name(client), client_credential(client))
					{
						removed.push((name.to_string(), cred.to_string()));
					}
				}
				!matched
			});
		}

		self.store(&doc)?;
		self.store_disabled(&disabled)?;
		Ok(removed)
	}

	/// Toggles the user across every inbound on this node. Returns the
	/// number of credentials that changed state, which is zero when the
	/// user is already in the requested state.
	pub fn set_enabled(&self, username: &str, enabled: bool) -> Result<u32, CoreError> {
		let mut doc = self.load()?;
		let mut disabled = self.load_disabled()?;

		let known_live = user_inbounds(&doc).iter().any(|(_, _, clients)| {
			clients
				.iter()
				.any(|c| client_name(c).is_some_and(|n| n == username))
		});
		let known_parked = disabled.values().any(|clients| {
			clients
				.iter()
				.any(|c| client_name(c).is_some_and(|n| n == username))
		});
		if !known_live && !known_parked {
			return Err(CoreError::NotFound(username.to_string()));
		}

		let mut affected = 0u32;
		if enabled {
			for (tag, clients) in disabled.iter_mut() {
				let mut restored = Vec::new();
				clients.retain(|client| {
					let matched = client_name(client).is_some_and(|n| n == username);
					if matched {
						restored.push(client.clone());
					}
					!matched
				});
				if restored.is_empty() {
					continue;
				}
				let live = inbound_clients_mut(&mut doc, tag)?;
				affected += restored.len() as u32;
				live.extend(restored);
			}
			disabled.retain(|_, clients| !clients.is_empty());
		} else {
			let tags: Vec<String> = user_inbounds(&doc)
				.iter()
				.map(|(tag, _, _)| tag.to_string())
				.collect();
			for tag in tags {
				let live = inbound_clients_mut(&mut doc, &tag)?;
				let mut parked = Vec::new();
				live.retain(|client| {
					let matched = client_name(client).is_some_and(|n| n == username);
					if matched {
						parked.push(client.clone());
					}
					!matched
				});
				if parked.is_empty() {
					continue;
				}
				affected += parked.len() as u32;
				disabled.entry(tag).or_default().extend(parked);
			}
		}

		self.store(&doc)?;
		self.store_disabled(&disabled)?;
		Ok(affected)
	}
}

fn write_replace(path: &Path, contents: &str) -> Result<(), CoreError> {
	let tmp = path.with_extension("tmp");
	std::fs::write(&tmp, contents)?;
	std::fs::rename(&tmp, path)?;
	Ok(())
}

fn client_name(client: &Value) -> Option<&str> {
	client["email"].as_str()
}

fn client_credential(client: &Value) -> Option<&str> {
	client["id"].as_str().or_else(|| client["password"].as_str())
}

/// All vless/trojan inbounds as `(tag, protocol, clients)`.
fn user_inbounds(doc: &Value) -> Vec<(&str, Protocol, &[Value])> {
	doc["inbounds"]
		.as_array()
		.map(|inbounds| {
			inbounds
				.iter()
				.filter_map(|inbound| {
					let tag = inbound["tag"].as_str()?;
					let protocol = Protocol::from_str(inbound["protocol"].as_str()?)?;
					let clients = inbound["settings"]["clients"]
						.as_array()
						.map(|v| v.as_slice())
						.unwrap_or(&[]);
					Some((tag, protocol, clients))
				})
				.collect()
		})
		.unwrap_or_default()
}

fn inbound_protocol(doc: &Value, inbound_tag: &str) -> Result<Protocol, CoreError> {
	let inbounds = doc["inbounds"]
		.as_array()
		.ok_or_else(|| CoreError::InboundNotFound(inbound_tag.to_string()))?;
	let inbound = inbounds
		.iter()
		.find(|i| i["tag"].as_str() == Some(inbound_tag))
		.ok_or_else(|| CoreError::InboundNotFound(inbound_tag.to_string()))?;
	let protocol = inbound["protocol"].as_str().unwrap_or_default();
	Protocol::from_str(protocol).ok_or_else(|| CoreError::UnsupportedProtocol {
		tag: inbound_tag.to_string(),
		protocol: protocol.to_string(),
	})
}

fn inbound_clients<'a>(doc: &'a Value, inbound_tag: &str) -> Option<Vec<&'a Value>> {
	let inbounds = doc["inbounds"].as_array()?;
	let inbound = inbounds
		.iter()
		.find(|i| i["tag"].as_str() == Some(inbound_tag))?;
	Some(
		inbound["settings"]["clients"]
			.as_array()
			.map(|c| c.iter().collect())
			.unwrap_or_default(),
	)
}

fn inbound_clients_mut<'a>(
	doc: &'a mut Value,
	inbound_tag: &str,
) -> Result<&'a mut Vec<Value>, CoreError> {
	let inbounds = doc["inbounds"]
		.as_array_mut()
		.ok_or_else(|| CoreError::InboundNotFound(inbound_tag.to_string()))?;
	let inbound = inbounds
		.iter_mut()
		.find(|i| i["tag"].as_str() == Some(inbound_tag))
		.ok_or_else(|| CoreError::InboundNotFound(inbound_tag.to_string()))?;
	let settings = &mut inbound["settings"];
	if settings.is_null() {
		*settings = json!({});
	}
	let clients = &mut settings["clients"];
	if clients.is_null() {
		*clients = json!([]);
	}
	clients
		.as_array_mut()
		.ok_or_else(|| CoreError::InboundNotFound(inbound_tag.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn core(dir: &tempfile::TempDir) -> CoreConfig {
		let path = dir.path().join("config.json");
		std::fs::write(
			&path,
			serde_json::to_string_pretty(&json!({
				"log": {"loglevel": "warning"},
				"inbounds": [
					{
						"tag": "vless-in",
						"protocol": "vless",
						"settings": {"clients": [
							{"id": "6c64b236-ad8a-4b44-a97c-7c7a4b1f8a60", "email": "alice"}
						]}
					},
					{
						"tag": "trojan-in",
						"protocol": "trojan",
						"settings": {"clients": []}
					},
					{"tag": "api", "protocol": "dokodemo-door"}
				]
			}))
			.unwrap(),
		)
		.unwrap();
		CoreConfig::new(path)
	}

	#[test]
	fn add_generates_uuid_for_vless() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		let outcome = cfg.add_users(&["bob".into()], "vless-in").unwrap();
		assert_eq!(outcome.protocol, Protocol::Vless);
		assert_eq!(outcome.credentials.len(), 1);
		Uuid::parse_str(&outcome.credentials[0].1).unwrap();

		let listed = cfg.list_users().unwrap();
		assert!(listed.iter().any(|u| u.name == "bob" && u.enabled));
	}

	#[test]
	fn add_generates_password_for_trojan() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		let outcome = cfg.add_users(&["bob".into()], "trojan-in").unwrap();
		assert_eq!(outcome.protocol, Protocol::Trojan);
		let cred = &outcome.credentials[0].1;
		assert_eq!(cred.len(), TROJAN_PASSWORD_LEN);
		assert!(cred.chars().all(|c| c.is_ascii_alphanumeric()));
	}

	#[test]
	fn add_is_all_or_nothing_on_collision() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		let err = cfg
			.add_users(&["bob".into(), "alice".into()], "vless-in")
			.unwrap_err();
		assert!(matches!(err, CoreError::AlreadyExists(name) if name == "alice"));
		// bob must not have been committed
		let listed = cfg.list_users().unwrap();
		assert!(!listed.iter().any(|u| u.name == "bob"));
	}

	#[test]
	fn add_to_unknown_inbound_fails() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		let err = cfg.add_users(&["bob".into()], "nope").unwrap_err();
		assert!(matches!(err, CoreError::InboundNotFound(_)));
	}

	#[test]
	fn delete_requires_all_users_present() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		let err = cfg
			.delete_users(&["alice".into(), "ghost".into()], "vless-in")
			.unwrap_err();
		assert!(matches!(err, CoreError::NotFound(name) if name == "ghost"));
		assert!(cfg.list_users().unwrap().iter().any(|u| u.name == "alice"));

		let removed = cfg.delete_users(&["alice".into()], "vless-in").unwrap();
		assert_eq!(removed.len(), 1);
		assert_eq!(removed[0].0, "alice");
		assert!(cfg.list_users().unwrap().is_empty());
	}

	#[test]
	fn disable_parks_user_and_enable_restores() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		assert_eq!(cfg.set_enabled("alice", false).unwrap(), 1);

		let listed = cfg.list_users().unwrap();
		let alice = listed.iter().find(|u| u.name == "alice").unwrap();
		assert!(!alice.enabled);
		assert_eq!(alice.credentials.len(), 1);

		// Live config must no longer carry the client.
		let doc: Value =
			serde_json::from_str(&std::fs::read_to_string(dir.path().join("config.json")).unwrap())
				.unwrap();
		assert!(doc["inbounds"][0]["settings"]["clients"].as_array().unwrap().is_empty());

		assert_eq!(cfg.set_enabled("alice", true).unwrap(), 1);
		assert!(cfg.list_users().unwrap()[0].enabled);
		// Second enable is a no-op.
		assert_eq!(cfg.set_enabled("alice", true).unwrap(), 0);
	}

	#[test]
	fn set_enabled_unknown_user_is_not_found() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		assert!(matches!(
			cfg.set_enabled("ghost", false).unwrap_err(),
			CoreError::NotFound(_)
		));
	}

	#[test]
	fn mutation_preserves_unknown_fields() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = core(&dir);
		cfg.add_users(&["bob".into()], "vless-in").unwrap();
		let doc: Value =
			serde_json::from_str(&std::fs::read_to_string(dir.path().join("config.json")).unwrap())
				.unwrap();
		assert_eq!(doc["log"]["loglevel"], "warning");
		assert_eq!(doc["inbounds"][2]["tag"], "api");
	}
}
