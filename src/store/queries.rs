//! Typed operations over the store schema. Everything here takes a plain
//! connection; callers pick the tier and priority by going through
//! [`crate::store::Store`].

use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use vstat_proto::sub::v1 as subpb;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRec {
	pub name: String,
	pub address: String,
	pub port: u16,
}

/// Make the nodes table exactly match the configured fleet. Rows of nodes
/// that left the config cascade away with all their per-node state.
pub fn replace_nodes(conn: &mut Connection, nodes: &[NodeRec]) -> rusqlite::Result<()> {
	let tx = conn.transaction()?;
	if nodes.is_empty() {
		tx.execute("DELETE FROM nodes", [])?;
	} else {
		let placeholders = placeholders(nodes.len());
		tx.execute(
			&format!("DELETE FROM nodes WHERE name NOT IN ({placeholders})"),
			params_from_iter(nodes.iter().map(|n| n.name.clone())),
		)?;
	}
	for node in nodes {
		tx.execute(
			"INSERT OR REPLACE INTO nodes (name, address, port) VALUES (?1, ?2, ?3)",
			params![node.name, node.address, node.port],
		)?;
	}
	tx.commit()
}

/// Commit one successful per-node add: traffic rows stamped with the
/// creation hour, then the credentials the node generated.
pub fn commit_add(
	conn: &mut Connection,
	node: &str,
	credentials: &[(String, String, String)], // (user, credential, inbound_tag)
	created: &str,
) -> rusqlite::Result<()> {
	let tx = conn.transaction()?;
	for (user, credential, inbound_tag) in credentials {
		tx.execute(
			"INSERT INTO user_traffic (node, user, created) VALUES (?1, ?2, ?3)
			 ON CONFLICT (node, user) DO NOTHING",
			params![node, user, created],
		)?;
		tx.execute(
			"INSERT OR IGNORE INTO user_credentials (node, user, credential, inbound_tag)
			 VALUES (?1, ?2, ?3, ?4)",
			params![node, user, credential, inbound_tag],
		)?;
	}
	tx.commit()
}

/// Commit one successful per-node delete. Credentials cascade; the users
/// trigger reaps parents that lost their last traffic row.
pub fn commit_delete(conn: &mut Connection, node: &str, users: &[String]) -> rusqlite::Result<()> {
	if users.is_empty() {
		return Ok(());
	}
	let tx = conn.transaction()?;
	let placeholders = placeholders(users.len());
	let mut args: Vec<String> = vec![node.to_string()];
	args.extend(users.iter().cloned());
	tx.execute(
		&format!("DELETE FROM user_traffic WHERE node = ?1 AND user IN ({placeholders})"),
		params_from_iter(args),
	)?;
	tx.commit()
}

pub fn set_enabled(conn: &Connection, user: &str, enabled: bool) -> rusqlite::Result<usize> {
	// Boolean on the wire, text at rest.
	let stored = if enabled { "true" } else { "false" };
	conn.execute(
		"UPDATE users SET enabled = ?1 WHERE user = ?2 AND enabled != ?1",
		params![stored, user],
	)
}

pub fn get_enabled(conn: &Connection, user: &str) -> rusqlite::Result<Option<String>> {
	conn
		.query_row(
			"SELECT enabled FROM users WHERE user = ?1",
			params![user],
			|r| r.get(0),
		)
		.optional()
}

pub fn user_exists(conn: &Connection, user: &str) -> rusqlite::Result<bool> {
	conn
		.query_row("SELECT 1 FROM users WHERE user = ?1", params![user], |_| Ok(()))
		.optional()
		.map(|row| row.is_some())
}

/// Does the user have a traffic row on any of the given nodes?
pub fn user_on_nodes(conn: &Connection, user: &str, nodes: &[String]) -> rusqlite::Result<bool> {
	if nodes.is_empty() {
		return Ok(false);
	}
	let placeholders = placeholders(nodes.len());
	let mut args: Vec<String> = vec![user.to_string()];
	args.extend(nodes.iter().cloned());
	conn
		.query_row(
			&format!("SELECT 1 FROM user_traffic WHERE user = ?1 AND node IN ({placeholders}) LIMIT 1"),
			params_from_iter(args),
			|_| Ok(()),
		)
		.optional()
		.map(|row| row.is_some())
}

pub fn users_on_node(conn: &Connection, node: &str) -> rusqlite::Result<Vec<String>> {
	let mut stmt = conn.prepare("SELECT user FROM user_traffic WHERE node = ?1")?;
	let rows = stmt.query_map(params![node], |r| r.get(0))?;
	rows.collect()
}

/// First inbound tag recorded for a user anywhere in the fleet; used when
/// the convergence sync has to re-add a user to a node.
pub fn any_inbound_tag(conn: &Connection, user: &str) -> rusqlite::Result<Option<String>> {
	conn
		.query_row(
			"SELECT inbound_tag FROM user_credentials WHERE user = ?1 LIMIT 1",
			params![user],
			|r| r.get(0),
		)
		.optional()
}

#[derive(Clone, Debug)]
pub struct NodeUserSync {
	pub user: String,
	pub credentials: Vec<(String, String)>, // (inbound_tag, credential)
}

/// User-loop reconciliation for one node: the node's reported user set
/// becomes the store's view, credentials upserted.
pub fn apply_user_sync(
	conn: &mut Connection,
	node: &str,
	users: &[NodeUserSync],
	created: &str,
) -> rusqlite::Result<()> {
	let tx = conn.transaction()?;
	if users.is_empty() {
		tx.execute("DELETE FROM user_traffic WHERE node = ?1", params![node])?;
	} else {
		let placeholders = placeholders(users.len());
		let mut args: Vec<String> = vec![node.to_string()];
		args.extend(users.iter().map(|u| u.user.clone()));
		tx.execute(
			&format!("DELETE FROM user_traffic WHERE node = ?1 AND user NOT IN ({placeholders})"),
			params_from_iter(args),
		)?;
	}
	for user in users {
		tx.execute(
			"INSERT INTO user_traffic (node, user, created) VALUES (?1, ?2, ?3)
			 ON CONFLICT (node, user) DO NOTHING",
			params![node, user.user, created],
		)?;
		for (inbound_tag, credential) in &user.credentials {
			tx.execute(
				"INSERT OR IGNORE INTO user_credentials (node, user, credential, inbound_tag)
				 VALUES (?1, ?2, ?3, ?4)",
				params![node, user.user, credential, inbound_tag],
			)?;
		}
	}
	tx.commit()
}

#[derive(Clone, Debug, Default)]
pub struct TrafficUpsert {
	pub name: String,
	pub delta_uplink: u64,
	pub delta_downlink: u64,
	pub sess_uplink: u64,
	pub sess_downlink: u64,
	pub rate_bps: u64,
	/// `None` leaves the stored value untouched.
	pub last_seen: Option<String>,
}

/// One traffic-loop tick for one node, applied in a single transaction.
pub fn apply_traffic(
	conn: &mut Connection,
	node: &str,
	users: &[TrafficUpsert],
	bounds: &[TrafficUpsert],
	created: &str,
) -> rusqlite::Result<()> {
	let tx = conn.transaction()?;
	for u in users {
		tx.execute(
			"INSERT INTO user_traffic
				(node, user, rate, uplink, downlink, sess_uplink, sess_downlink, last_seen, created)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, ''), ?9)
			 ON CONFLICT (node, user) DO UPDATE SET
				rate = ?3,
				uplink = uplink + ?4,
				downlink = downlink + ?5,
				sess_uplink = ?6,
				sess_downlink = ?7,
				last_seen = COALESCE(?8, last_seen)",
			params![
				node,
				u.name,
				u.rate_bps as i64,
				u.delta_uplink as i64,
				u.delta_downlink as i64,
				u.sess_uplink as i64,
				u.sess_downlink as i64,
				u.last_seen,
				created,
			],
		)?;
	}
	for b in bounds {
		tx.execute(
			"INSERT INTO bound_traffic
				(node, source, rate, uplink, downlink, sess_uplink, sess_downlink)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
			 ON CONFLICT (node, source) DO UPDATE SET
				rate = ?3,
				uplink = uplink + ?4,
				downlink = downlink + ?5,
				sess_uplink = ?6,
				sess_downlink = ?7",
			params![
				node,
				b.name,
				b.rate_bps as i64,
				b.delta_uplink as i64,
				b.delta_downlink as i64,
				b.sess_uplink as i64,
				b.sess_downlink as i64,
			],
		)?;
	}
	tx.commit()
}

/// Increment-add DNS observations for one node.
pub fn add_dns(
	conn: &mut Connection,
	node: &str,
	per_user: &[(String, Vec<(String, u64)>)],
) -> rusqlite::Result<()> {
	let tx = conn.transaction()?;
	for (user, domains) in per_user {
		for (domain, count) in domains {
			tx.execute(
				"INSERT INTO user_dns (node, user, domain, count) VALUES (?1, ?2, ?3, ?4)
				 ON CONFLICT (node, user, domain) DO UPDATE SET count = count + ?4",
				params![node, user, domain, *count as i64],
			)?;
		}
	}
	tx.commit()
}

pub fn set_user_ips(conn: &Connection, user: &str, ips: &str) -> rusqlite::Result<usize> {
	conn.execute(
		"UPDATE users SET ips = ?1 WHERE user = ?2",
		params![ips, user],
	)
}

pub fn update_lim_ip(conn: &Connection, user: &str, lim_ip: u32) -> rusqlite::Result<usize> {
	conn.execute(
		"UPDATE users SET lim_ip = ?1 WHERE user = ?2",
		params![lim_ip, user],
	)
}

pub fn update_renew(conn: &Connection, user: &str, renew: u32) -> rusqlite::Result<usize> {
	conn.execute(
		"UPDATE users SET renew = ?1 WHERE user = ?2",
		params![renew, user],
	)
}

pub fn get_sub_end(conn: &Connection, user: &str) -> rusqlite::Result<Option<i64>> {
	conn
		.query_row(
			"SELECT sub_end FROM users WHERE user = ?1",
			params![user],
			|r| r.get(0),
		)
		.optional()
}

pub fn set_sub_end(conn: &Connection, user: &str, sub_end: i64) -> rusqlite::Result<usize> {
	conn.execute(
		"UPDATE users SET sub_end = ?1 WHERE user = ?2",
		params![sub_end, user],
	)
}

fn node_filter_clause(nodes: &Option<Vec<String>>) -> (String, Vec<String>) {
	match nodes {
		Some(nodes) if !nodes.is_empty() => (
			format!(" WHERE node IN ({})", placeholders(nodes.len())),
			nodes.clone(),
		),
		_ => (String::new(), Vec::new()),
	}
}

pub fn reset_bound_traffic(
	conn: &Connection,
	nodes: &Option<Vec<String>>,
) -> rusqlite::Result<usize> {
	let (clause, args) = node_filter_clause(nodes);
	conn.execute(
		&format!(
			"UPDATE bound_traffic
			 SET rate = 0, uplink = 0, downlink = 0, sess_uplink = 0, sess_downlink = 0{clause}"
		),
		params_from_iter(args),
	)
}

pub fn reset_user_traffic(
	conn: &Connection,
	nodes: &Option<Vec<String>>,
) -> rusqlite::Result<usize> {
	let (clause, args) = node_filter_clause(nodes);
	conn.execute(
		&format!(
			"UPDATE user_traffic
			 SET rate = 0, uplink = 0, downlink = 0, sess_uplink = 0, sess_downlink = 0{clause}"
		),
		params_from_iter(args),
	)
}

pub fn reset_dns(conn: &Connection, nodes: &Option<Vec<String>>) -> rusqlite::Result<usize> {
	let (clause, args) = node_filter_clause(nodes);
	conn.execute(
		&format!("DELETE FROM user_dns{clause}"),
		params_from_iter(args),
	)
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct DnsRow {
	pub node: String,
	pub user: String,
	pub domain: String,
	pub count: i64,
}

pub fn dns_stats(
	conn: &Connection,
	node: Option<&str>,
	user: Option<&str>,
	domain: Option<&str>,
	count: u32,
) -> rusqlite::Result<Vec<DnsRow>> {
	let mut sql = String::from("SELECT node, user, domain, count FROM user_dns WHERE 1=1");
	let mut args: Vec<String> = Vec::new();
	if let Some(node) = node {
		args.push(node.to_string());
		sql.push_str(&format!(" AND node = ?{}", args.len()));
	}
	if let Some(user) = user {
		args.push(user.to_string());
		sql.push_str(&format!(" AND user = ?{}", args.len()));
	}
	if let Some(domain) = domain {
		args.push(format!("%{domain}%"));
		sql.push_str(&format!(" AND domain LIKE ?{}", args.len()));
	}
	sql.push_str(&format!(" ORDER BY count DESC LIMIT {count}"));

	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt.query_map(params_from_iter(args), |r| {
		Ok(DnsRow {
			node: r.get(0)?,
			user: r.get(1)?,
			domain: r.get(2)?,
			count: r.get(3)?,
		})
	})?;
	rows.collect()
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ApiUser {
	pub user: String,
	pub inbounds: Vec<String>,
	pub rate: i64,
	pub enabled: String,
	pub created: String,
	pub sub_end: i64,
	pub renew: i64,
	pub lim_ip: i64,
	pub ips: String,
	pub uplink: i64,
	pub downlink: i64,
	pub traffic_cap: i64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ApiNodeGroup {
	pub node: String,
	pub address: String,
	pub port: u16,
	pub users: Vec<ApiUser>,
}

/// The `/api/v1/users` view: every user on every node, grouped by node.
pub fn users_grouped(conn: &Connection) -> rusqlite::Result<Vec<ApiNodeGroup>> {
	let mut groups: BTreeMap<String, ApiNodeGroup> = BTreeMap::new();
	{
		let mut stmt = conn.prepare("SELECT name, address, port FROM nodes ORDER BY name")?;
		let rows = stmt.query_map([], |r| {
			Ok(ApiNodeGroup {
				node: r.get(0)?,
				address: r.get(1)?,
				port: r.get(2)?,
				users: Vec::new(),
			})
		})?;
		for group in rows {
			let group = group?;
			groups.insert(group.node.clone(), group);
		}
	}

	let mut inbounds: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
	{
		let mut stmt =
			conn.prepare("SELECT node, user, inbound_tag FROM user_credentials ORDER BY inbound_tag")?;
		let rows = stmt.query_map([], |r| {
			Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
		})?;
		for row in rows {
			let (node, user, tag) = row?;
			let tags = inbounds.entry((node, user)).or_default();
			if !tags.contains(&tag) {
				tags.push(tag);
			}
		}
	}

	let mut stmt = conn.prepare(
		"SELECT t.node, t.user, t.rate, t.uplink, t.downlink, t.created,
			u.enabled, u.sub_end, u.renew, u.lim_ip, u.ips, u.traffic_cap
		 FROM user_traffic t JOIN users u ON u.user = t.user
		 ORDER BY t.node, t.user",
	)?;
	let rows = stmt.query_map([], |r| {
		let node: String = r.get(0)?;
		let user: String = r.get(1)?;
		Ok((
			node.clone(),
			ApiUser {
				inbounds: Vec::new(),
				user,
				rate: r.get(2)?,
				uplink: r.get(3)?,
				downlink: r.get(4)?,
				created: r.get(5)?,
				enabled: r.get(6)?,
				sub_end: r.get(7)?,
				renew: r.get(8)?,
				lim_ip: r.get(9)?,
				ips: r.get(10)?,
				traffic_cap: r.get(11)?,
			},
		))
	})?;
	for row in rows {
		let (node, mut user) = row?;
		user.inbounds = inbounds
			.remove(&(node.clone(), user.user.clone()))
			.unwrap_or_default();
		if let Some(group) = groups.get_mut(&node) {
			group.users.push(user);
		}
	}
	Ok(groups.into_values().collect())
}

/// The complete fleet view streamed to the subscription service.
pub fn node_users_view(conn: &Connection) -> rusqlite::Result<Vec<subpb::NodeUsers>> {
	let groups = users_grouped(conn)?;
	let mut credentials: BTreeMap<(String, String), Vec<subpb::SubCredential>> = BTreeMap::new();
	{
		let mut stmt =
			conn.prepare("SELECT node, user, credential, inbound_tag FROM user_credentials")?;
		let rows = stmt.query_map([], |r| {
			Ok((
				r.get::<_, String>(0)?,
				r.get::<_, String>(1)?,
				r.get::<_, String>(2)?,
				r.get::<_, String>(3)?,
			))
		})?;
		for row in rows {
			let (node, user, credential, inbound_tag) = row?;
			credentials
				.entry((node, user))
				.or_default()
				.push(subpb::SubCredential {
					inbound_tag,
					protocol: credential_protocol(&credential).to_string(),
					credential,
				});
		}
	}

	Ok(
		groups
			.into_iter()
			.map(|group| subpb::NodeUsers {
				users: group
					.users
					.into_iter()
					.map(|u| subpb::SubUser {
						credentials: credentials
							.remove(&(group.node.clone(), u.user.clone()))
							.unwrap_or_default(),
						user: u.user,
						enabled: u.enabled == "true",
						sub_end: u.sub_end,
						renew: u.renew,
						lim_ip: u.lim_ip,
						traffic_cap: u.traffic_cap,
						uplink: u.uplink.max(0) as u64,
						downlink: u.downlink.max(0) as u64,
					})
					.collect(),
				node: group.node,
				address: group.address,
				port: group.port as u32,
			})
			.collect(),
	)
}

/// VLESS credentials are UUIDs; everything else is a Trojan password.
fn credential_protocol(credential: &str) -> &'static str {
	let is_uuid = credential.len() == 36
		&& credential.chars().enumerate().all(|(i, c)| match i {
			8 | 13 | 18 | 23 => c == '-',
			_ => c.is_ascii_hexdigit(),
		});
	if is_uuid { "vless" } else { "trojan" }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatsKind {
	Server,
	Client,
}

#[derive(Clone, Copy)]
enum ColumnRole {
	Key,
	Sum,
	Max,
}

const SERVER_COLUMNS: &[(&str, &str, ColumnRole)] = &[
	("node", "node", ColumnRole::Key),
	("source", "source", ColumnRole::Key),
	("rate", "rate", ColumnRole::Sum),
	("uplink", "uplink", ColumnRole::Sum),
	("downlink", "downlink", ColumnRole::Sum),
	("sess_uplink", "sess_uplink", ColumnRole::Sum),
	("sess_downlink", "sess_downlink", ColumnRole::Sum),
];

const CLIENT_COLUMNS: &[(&str, &str, ColumnRole)] = &[
	("node", "t.node", ColumnRole::Key),
	("user", "t.user", ColumnRole::Key),
	("last_seen", "t.last_seen", ColumnRole::Max),
	("rate", "t.rate", ColumnRole::Sum),
	("uplink", "t.uplink", ColumnRole::Sum),
	("downlink", "t.downlink", ColumnRole::Sum),
	("sess_uplink", "t.sess_uplink", ColumnRole::Sum),
	("sess_downlink", "t.sess_downlink", ColumnRole::Sum),
	("created", "t.created", ColumnRole::Max),
	("enabled", "u.enabled", ColumnRole::Max),
	("sub_end", "u.sub_end", ColumnRole::Max),
	("renew", "u.renew", ColumnRole::Max),
	("lim_ip", "u.lim_ip", ColumnRole::Max),
	("ips", "u.ips", ColumnRole::Max),
	("traffic_cap", "u.traffic_cap", ColumnRole::Max),
];

pub fn is_valid_column(kind: StatsKind, name: &str) -> bool {
	let catalog = match kind {
		StatsKind::Server => SERVER_COLUMNS,
		StatsKind::Client => CLIENT_COLUMNS,
	};
	catalog.iter().any(|(n, _, _)| *n == name)
}

#[derive(Clone, Debug)]
pub struct StatsQuery {
	pub kind: StatsKind,
	pub columns: Vec<String>,
	pub sort_by: String,
	pub sort_desc: bool,
	pub node: Option<String>,
	pub user: Option<String>,
	pub aggregate: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StatsQueryError {
	#[error("unknown column {0}")]
	UnknownColumn(String),
	#[error("sql: {0}")]
	Sql(#[from] rusqlite::Error),
}

/// Build and run one stats-table query. Column and sort names are resolved
/// against a whitelist, never interpolated from user input directly.
pub fn stats_table(
	conn: &Connection,
	query: &StatsQuery,
) -> Result<(Vec<String>, Vec<Vec<String>>), StatsQueryError> {
	let catalog = match query.kind {
		StatsKind::Server => SERVER_COLUMNS,
		StatsKind::Client => CLIENT_COLUMNS,
	};
	let resolve = |name: &str| -> Result<(&'static str, &'static str, ColumnRole), StatsQueryError> {
		catalog
			.iter()
			.find(|(n, _, _)| *n == name)
			.copied()
			.ok_or_else(|| StatsQueryError::UnknownColumn(name.to_string()))
	};

	let mut headers = Vec::new();
	let mut selects = Vec::new();
	for name in &query.columns {
		let (name, expr, role) = resolve(name)?;
		// Aggregation folds nodes together, so the node column is dropped.
		if query.aggregate && name == "node" {
			continue;
		}
		headers.push(name.to_string());
		let expr = if query.aggregate {
			match role {
				ColumnRole::Key => expr.to_string(),
				ColumnRole::Sum => format!("SUM({expr})"),
				ColumnRole::Max => format!("MAX({expr})"),
			}
		} else {
			expr.to_string()
		};
		selects.push(format!("{expr} AS {name}"));
	}
	resolve(&query.sort_by)?;

	let from = match query.kind {
		StatsKind::Server => "bound_traffic",
		StatsKind::Client => "user_traffic t JOIN users u ON u.user = t.user",
	};
	let mut sql = format!("SELECT {} FROM {from} WHERE 1=1", selects.join(", "));
	let mut args: Vec<String> = Vec::new();
	if let Some(node) = &query.node {
		args.push(node.clone());
		let column = match query.kind {
			StatsKind::Server => "node",
			StatsKind::Client => "t.node",
		};
		sql.push_str(&format!(" AND {column} = ?{}", args.len()));
	}
	if query.kind == StatsKind::Client {
		if let Some(user) = &query.user {
			args.push(user.clone());
			sql.push_str(&format!(" AND t.user = ?{}", args.len()));
		}
	}
	if query.aggregate {
		let group = match query.kind {
			StatsKind::Server => "source",
			StatsKind::Client => "t.user",
		};
		sql.push_str(&format!(" GROUP BY {group}"));
	}
	let order = if query.sort_desc { "DESC" } else { "ASC" };
	sql.push_str(&format!(" ORDER BY {} {order}", query.sort_by));

	let mut stmt = conn.prepare(&sql)?;
	let width = headers.len();
	let rows = stmt.query_map(params_from_iter(args), |r| {
		let mut row = Vec::with_capacity(width);
		for i in 0..width {
			let value: SqlValue = r.get(i)?;
			row.push(match value {
				SqlValue::Null => String::new(),
				SqlValue::Integer(v) => v.to_string(),
				SqlValue::Real(v) => v.to_string(),
				SqlValue::Text(v) => v,
				SqlValue::Blob(_) => String::new(),
			});
		}
		Ok(row)
	})?;
	let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
	Ok((headers, rows))
}

fn placeholders(n: usize) -> String {
	vec!["?"; n.max(1)].join(", ")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::schema;

	fn conn() -> Connection {
		let conn = Connection::open_in_memory().unwrap();
		schema::init_memory(&conn).unwrap();
		conn
	}

	fn with_nodes(names: &[&str]) -> Connection {
		let mut c = conn();
		let nodes: Vec<NodeRec> = names
			.iter()
			.map(|n| NodeRec {
				name: n.to_string(),
				address: "10.0.0.1".to_string(),
				port: 50051,
			})
			.collect();
		replace_nodes(&mut c, &nodes).unwrap();
		c
	}

	#[test]
	fn commit_add_creates_user_and_credentials() {
		let mut c = with_nodes(&["n1"]);
		commit_add(
			&mut c,
			"n1",
			&[("alice".into(), "uuid-1".into(), "vless-in".into())],
			"2026-08-01 12:00",
		)
		.unwrap();
		assert!(user_exists(&c, "alice").unwrap());
		let created: String = c
			.query_row("SELECT created FROM user_traffic WHERE user = 'alice'", [], |r| r.get(0))
			.unwrap();
		assert_eq!(created, "2026-08-01 12:00");
	}

	#[test]
	fn commit_delete_reaps_user_via_trigger() {
		let mut c = with_nodes(&["n1"]);
		commit_add(
			&mut c,
			"n1",
			&[("alice".into(), "uuid-1".into(), "vless-in".into())],
			"t",
		)
		.unwrap();
		commit_delete(&mut c, "n1", &["alice".into()]).unwrap();
		assert!(!user_exists(&c, "alice").unwrap());
		let creds: i64 = c
			.query_row("SELECT COUNT(*) FROM user_credentials", [], |r| r.get(0))
			.unwrap();
		assert_eq!(creds, 0);
	}

	#[test]
	fn set_enabled_is_idempotent_on_rows_affected() {
		let mut c = with_nodes(&["n1"]);
		commit_add(&mut c, "n1", &[("alice".into(), "x".into(), "in".into())], "t").unwrap();
		assert_eq!(set_enabled(&c, "alice", false).unwrap(), 1);
		assert_eq!(set_enabled(&c, "alice", false).unwrap(), 0);
		assert_eq!(set_enabled(&c, "alice", true).unwrap(), 1);
		assert_eq!(set_enabled(&c, "alice", true).unwrap(), 0);
	}

	#[test]
	fn traffic_totals_accumulate_but_sessions_overwrite() {
		let mut c = with_nodes(&["n1"]);
		let tick = |delta: u64, sess: u64| TrafficUpsert {
			name: "alice".into(),
			delta_uplink: delta,
			delta_downlink: 0,
			sess_uplink: sess,
			sess_downlink: 0,
			rate_bps: 10,
			last_seen: Some("online".into()),
		};
		apply_traffic(&mut c, "n1", &[tick(100, 1100)], &[], "t").unwrap();
		apply_traffic(&mut c, "n1", &[tick(50, 1150)], &[], "t").unwrap();
		let (uplink, sess): (i64, i64) = c
			.query_row(
				"SELECT uplink, sess_uplink FROM user_traffic WHERE user = 'alice'",
				[],
				|r| Ok((r.get(0)?, r.get(1)?)),
			)
			.unwrap();
		assert_eq!(uplink, 150);
		assert_eq!(sess, 1150);
	}

	#[test]
	fn last_seen_none_keeps_stored_value() {
		let mut c = with_nodes(&["n1"]);
		let mut up = TrafficUpsert {
			name: "alice".into(),
			last_seen: Some("online".into()),
			..Default::default()
		};
		apply_traffic(&mut c, "n1", std::slice::from_ref(&up), &[], "t").unwrap();
		up.last_seen = None;
		apply_traffic(&mut c, "n1", &[up], &[], "t").unwrap();
		let last_seen: String = c
			.query_row("SELECT last_seen FROM user_traffic WHERE user = 'alice'", [], |r| r.get(0))
			.unwrap();
		assert_eq!(last_seen, "online");
	}

	#[test]
	fn dns_counts_increment_add() {
		let mut c = with_nodes(&["n1"]);
		add_dns(&mut c, "n1", &[("u".into(), vec![("example.com".into(), 5)])]).unwrap();
		add_dns(
			&mut c,
			"n1",
			&[("u".into(), vec![("example.com".into(), 3), ("foo.bar".into(), 1)])],
		)
		.unwrap();
		let rows = dns_stats(&c, None, None, None, 20).unwrap();
		let get = |d: &str| rows.iter().find(|r| r.domain == d).unwrap().count;
		assert_eq!(get("example.com"), 8);
		assert_eq!(get("foo.bar"), 1);
	}

	#[test]
	fn user_sync_inserts_missing_and_deletes_absent() {
		let mut c = with_nodes(&["n1"]);
		commit_add(&mut c, "n1", &[("old".into(), "x".into(), "in".into())], "t").unwrap();
		apply_user_sync(
			&mut c,
			"n1",
			&[NodeUserSync {
				user: "new".into(),
				credentials: vec![("vless-in".into(), "uuid-9".into())],
			}],
			"t",
		)
		.unwrap();
		assert!(!user_exists(&c, "old").unwrap());
		assert!(user_exists(&c, "new").unwrap());
	}

	#[test]
	fn stats_table_aggregates_across_nodes() {
		let mut c = with_nodes(&["n1", "n2"]);
		for node in ["n1", "n2"] {
			apply_traffic(
				&mut c,
				node,
				&[TrafficUpsert {
					name: "alice".into(),
					delta_uplink: 100,
					..Default::default()
				}],
				&[],
				"t",
			)
			.unwrap();
		}
		let (headers, rows) = stats_table(
			&c,
			&StatsQuery {
				kind: StatsKind::Client,
				columns: vec!["node".into(), "user".into(), "uplink".into()],
				sort_by: "uplink".into(),
				sort_desc: true,
				node: None,
				user: None,
				aggregate: true,
			},
		)
		.unwrap();
		assert_eq!(headers, vec!["user".to_string(), "uplink".to_string()]);
		assert_eq!(rows, vec![vec!["alice".to_string(), "200".to_string()]]);
	}

	#[test]
	fn stats_table_rejects_unknown_columns() {
		let c = conn();
		let err = stats_table(
			&c,
			&StatsQuery {
				kind: StatsKind::Server,
				columns: vec!["node; DROP TABLE users".into()],
				sort_by: "rate".into(),
				sort_desc: false,
				node: None,
				user: None,
				aggregate: false,
			},
		)
		.unwrap_err();
		assert!(matches!(err, StatsQueryError::UnknownColumn(_)));
	}

	#[test]
	fn credential_protocol_detection() {
		assert_eq!(credential_protocol("6c64b236-ad8a-4b44-a97c-7c7a4b1f8a60"), "vless");
		assert_eq!(credential_protocol("s3cretPassw0rd16"), "trojan");
	}
}
