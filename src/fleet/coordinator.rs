//! Fleet commands: add/delete/set_enabled fanned out to the selected
//! nodes in parallel. Each node's result is committed to the store in its
//! own transaction, so one node failing never rolls back another; the
//! caller gets the full per-node result map.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::clock;
use crate::fleet::{FleetClient, NodeHandle};
use crate::store::{Store, StoreError, queries};

const MAX_USERNAME_LEN: usize = 255;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
	#[error("invalid username {0:?}")]
	InvalidUsername(String),
	#[error("unknown node {0}")]
	UnknownNode(String),
	#[error("no nodes configured")]
	NoNodes,
	#[error("user {0} not found")]
	UserNotFound(String),
	#[error("store: {0}")]
	Store(#[from] StoreError),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CommandOutcome {
	/// Nodes that executed the command, mapped to their status message.
	pub results: BTreeMap<String, String>,
	/// Failed nodes, mapped to the node's error message.
	pub errors: BTreeMap<String, String>,
	/// For add: node → user → generated credential.
	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub credentials: BTreeMap<String, BTreeMap<String, String>>,
}

impl CommandOutcome {
	pub fn all_succeeded(&self) -> bool {
		self.errors.is_empty() && !self.results.is_empty()
	}

	/// 200 when every node succeeded, 207 on partial success, 500 when
	/// no node succeeded.
	pub fn http_status(&self) -> http::StatusCode {
		if self.errors.is_empty() {
			http::StatusCode::OK
		} else if self.results.is_empty() {
			http::StatusCode::INTERNAL_SERVER_ERROR
		} else {
			http::StatusCode::MULTI_STATUS
		}
	}
}

pub struct Coordinator {
	fleet: Arc<FleetClient>,
	store: Store,
}

impl Coordinator {
	pub fn new(fleet: Arc<FleetClient>, store: Store) -> Coordinator {
		Coordinator { fleet, store }
	}

	pub fn validate_usernames(usernames: &[String]) -> Result<(), CommandError> {
		for name in usernames {
			let ok = !name.is_empty()
				&& name.len() <= MAX_USERNAME_LEN
				&& name
					.chars()
					.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
			if !ok {
				return Err(CommandError::InvalidUsername(name.clone()));
			}
		}
		Ok(())
	}

	/// Absent target list means the whole fleet. Unknown names fail the
	/// command before anything is dispatched.
	fn resolve_targets(&self, targets: &Option<Vec<String>>) -> Result<Vec<NodeHandle>, CommandError> {
		let names = match targets {
			Some(names) if !names.is_empty() => names.clone(),
			_ => self.fleet.names(),
		};
		if names.is_empty() {
			return Err(CommandError::NoNodes);
		}
		names
			.iter()
			.map(|name| {
				self
					.fleet
					.get(name)
					.cloned()
					.ok_or_else(|| CommandError::UnknownNode(name.clone()))
			})
			.collect()
	}

	pub async fn add_users(
		&self,
		usernames: Vec<String>,
		inbound_tag: String,
		targets: Option<Vec<String>>,
	) -> Result<CommandOutcome, CommandError> {
		Self::validate_usernames(&usernames)?;
		let handles = self.resolve_targets(&targets)?;

		let mut join = JoinSet::new();
		for handle in handles {
			let usernames = usernames.clone();
			let inbound_tag = inbound_tag.clone();
			join.spawn(async move {
				let node = handle.rec.name.clone();
				(node, handle.add_users(usernames, inbound_tag).await)
			});
		}

		let mut outcome = CommandOutcome::default();
		while let Some(joined) = join.join_next().await {
			let Ok((node, result)) = joined else { continue };
			match result {
				Ok(response) => {
					let creds: Vec<(String, String, String)> = response
						.credentials
						.iter()
						.map(|c| (c.user.clone(), c.credential.clone(), c.inbound_tag.clone()))
						.collect();
					let created = clock::now_hour();
					let commit_node = node.clone();
					let commit_creds = creds.clone();
					let committed = self
						.store
						.high(move |conn| queries::commit_add(conn, &commit_node, &commit_creds, &created))
						.await;
					match committed {
						Ok(()) => {
							let per_user = outcome.credentials.entry(node.clone()).or_default();
							for (user, credential, _) in creds {
								per_user.insert(user, credential);
							}
							// A node may accept a user yet return no inbound
							// credential; the response then carries an empty one.
							for user in &usernames {
								per_user.entry(user.clone()).or_default();
							}
							outcome.results.insert(node, "ok".to_string());
						},
						Err(e) if e.is_constraint_violation() => {
							outcome.errors.insert(node, "already exists".to_string());
						},
						Err(e) => {
							outcome.errors.insert(node, format!("store: {e}"));
						},
					}
				},
				Err(status) => {
					outcome.errors.insert(node, status_message(&status));
				},
			}
		}

		if outcome.all_succeeded() {
			self.sync_fleet().await;
		}
		Ok(outcome)
	}

	pub async fn delete_users(
		&self,
		usernames: Vec<String>,
		inbound_tag: String,
		targets: Option<Vec<String>>,
	) -> Result<CommandOutcome, CommandError> {
		Self::validate_usernames(&usernames)?;
		let handles = self.resolve_targets(&targets)?;

		// Pre-verify in the store so a fat-fingered name fails fast.
		let target_names: Vec<String> = handles.iter().map(|h| h.rec.name.clone()).collect();
		for user in &usernames {
			let check_user = user.clone();
			let check_nodes = target_names.clone();
			let exists = self
				.store
				.high(move |conn| queries::user_on_nodes(conn, &check_user, &check_nodes))
				.await?;
			if !exists {
				return Err(CommandError::UserNotFound(user.clone()));
			}
		}

		let mut join = JoinSet::new();
		for handle in handles {
			let usernames = usernames.clone();
			let inbound_tag = inbound_tag.clone();
			join.spawn(async move {
				let node = handle.rec.name.clone();
				(node, handle.delete_users(usernames, inbound_tag).await)
			});
		}

		let mut outcome = CommandOutcome::default();
		while let Some(joined) = join.join_next().await {
			let Ok((node, result)) = joined else { continue };
			match result {
				Ok(_) => {
					let commit_node = node.clone();
					let commit_users = usernames.clone();
					let committed = self
						.store
						.high(move |conn| queries::commit_delete(conn, &commit_node, &commit_users))
						.await;
					match committed {
						Ok(()) => {
							outcome.results.insert(node, "ok".to_string());
						},
						Err(e) => {
							outcome.errors.insert(node, format!("store: {e}"));
						},
					}
				},
				Err(status) => {
					outcome.errors.insert(node, status_message(&status));
				},
			}
		}

		if outcome.all_succeeded() {
			self.sync_fleet().await;
		}
		Ok(outcome)
	}

	pub async fn set_enabled(
		&self,
		username: String,
		enabled: bool,
		targets: Option<Vec<String>>,
	) -> Result<CommandOutcome, CommandError> {
		Self::validate_usernames(std::slice::from_ref(&username))?;
		let handles = self.resolve_targets(&targets)?;

		let check_user = username.clone();
		let exists = self
			.store
			.high(move |conn| queries::user_exists(conn, &check_user))
			.await?;
		if !exists {
			return Err(CommandError::UserNotFound(username));
		}

		let mut join = JoinSet::new();
		for handle in handles {
			let username = username.clone();
			join.spawn(async move {
				let node = handle.rec.name.clone();
				(node, handle.set_user_enabled(username, enabled).await)
			});
		}

		let mut outcome = CommandOutcome::default();
		while let Some(joined) = join.join_next().await {
			let Ok((node, result)) = joined else { continue };
			match result {
				Ok(_) => {
					outcome.results.insert(node, "ok".to_string());
				},
				Err(status) => {
					outcome.errors.insert(node, status_message(&status));
				},
			}
		}

		if !outcome.results.is_empty() {
			let user = username.clone();
			self
				.store
				.high(move |conn| queries::set_enabled(conn, &user, enabled))
				.await?;
		}
		if outcome.all_succeeded() {
			self.sync_fleet().await;
		}
		Ok(outcome)
	}

	/// Post-command convergence: every node is driven toward the store's
	/// user set. Extraneous node users are removed, users the store knows
	/// but the node lost are re-added, enabled flags realigned. Failures
	/// are logged; the periodic loops retry anyway.
	pub async fn sync_fleet(&self) {
		let handles: Vec<NodeHandle> = self.fleet.handles().cloned().collect();
		for handle in handles {
			let node = handle.rec.name.clone();
			if let Err(e) = self.sync_node(&handle).await {
				warn!(node = %node, err = %e, "fleet convergence sync failed");
			}
		}
	}

	async fn sync_node(&self, handle: &NodeHandle) -> Result<(), CommandError> {
		let node = handle.rec.name.clone();
		let listed = match handle.list_users().await {
			Ok(listed) => listed,
			Err(status) => {
				warn!(node = %node, err = %status_message(&status), "convergence list failed");
				return Ok(());
			},
		};

		let query_node = node.clone();
		let store_users = self
			.store
			.high(move |conn| queries::users_on_node(conn, &query_node))
			.await?;

		// On the node but not in the store: remove, per inbound.
		for user in &listed.users {
			if store_users.contains(&user.user) {
				continue;
			}
			for credential in &user.credentials {
				if let Err(status) = handle
					.delete_users(vec![user.user.clone()], credential.inbound_tag.clone())
					.await
				{
					warn!(node = %node, user = %user.user, err = %status_message(&status), "convergence delete failed");
				}
			}
			info!(node = %node, user = %user.user, "removed stray node user");
		}

		// In the store but not on the node: re-add under the inbound the
		// user is known by elsewhere in the fleet.
		for user in &store_users {
			if listed.users.iter().any(|u| &u.user == user) {
				continue;
			}
			let lookup_user = user.clone();
			let tag = self
				.store
				.high(move |conn| queries::any_inbound_tag(conn, &lookup_user))
				.await?;
			let Some(tag) = tag else {
				warn!(node = %node, user = %user, "cannot re-add user without a known inbound");
				continue;
			};
			match handle.add_users(vec![user.clone()], tag).await {
				Ok(response) => {
					let creds: Vec<(String, String, String)> = response
						.credentials
						.iter()
						.map(|c| (c.user.clone(), c.credential.clone(), c.inbound_tag.clone()))
						.collect();
					let commit_node = node.clone();
					let created = clock::now_hour();
					self
						.store
						.high(move |conn| queries::commit_add(conn, &commit_node, &creds, &created))
						.await?;
					info!(node = %node, user = %user, "re-added missing node user");
				},
				Err(status) => {
					warn!(node = %node, user = %user, err = %status_message(&status), "convergence add failed");
				},
			}
		}

		// Enabled flags follow the store.
		for user in &listed.users {
			let lookup_user = user.user.clone();
			let Some(stored) = self
				.store
				.high(move |conn| queries::get_enabled(conn, &lookup_user))
				.await?
			else {
				continue;
			};
			let want = stored == "true";
			if want != user.enabled {
				if let Err(status) = handle.set_user_enabled(user.user.clone(), want).await {
					warn!(node = %node, user = %user.user, err = %status_message(&status), "convergence enable failed");
				}
			}
		}
		Ok(())
	}
}

fn status_message(status: &tonic::Status) -> String {
	let message = status.message();
	if message.is_empty() {
		format!("{:?}", status.code())
	} else {
		message.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn username_validation() {
		assert!(Coordinator::validate_usernames(&["alice-01_x".into()]).is_ok());
		assert!(Coordinator::validate_usernames(&["".into()]).is_err());
		assert!(Coordinator::validate_usernames(&["has space".into()]).is_err());
		assert!(Coordinator::validate_usernames(&["dot.name".into()]).is_err());
		assert!(Coordinator::validate_usernames(&["x".repeat(256)]).is_err());
		assert!(Coordinator::validate_usernames(&["x".repeat(255)]).is_ok());
	}

	#[test]
	fn outcome_status_mapping() {
		let mut outcome = CommandOutcome::default();
		outcome.results.insert("n1".into(), "ok".into());
		assert_eq!(outcome.http_status(), http::StatusCode::OK);

		outcome.errors.insert("n2".into(), "already exists".into());
		assert_eq!(outcome.http_status(), http::StatusCode::MULTI_STATUS);

		outcome.results.clear();
		assert_eq!(outcome.http_status(), http::StatusCode::INTERNAL_SERVER_ERROR);
	}
}
