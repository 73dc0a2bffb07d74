//! Shared DDL for the memory and file stores. Both tiers run the exact
//! same schema so rows can be copied table-by-table in either direction.

use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
	name TEXT PRIMARY KEY,
	address TEXT NOT NULL,
	port INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
	user TEXT PRIMARY KEY,
	enabled TEXT NOT NULL DEFAULT 'true',
	sub_end INTEGER NOT NULL DEFAULT 0,
	renew INTEGER NOT NULL DEFAULT 0,
	lim_ip INTEGER NOT NULL DEFAULT 0,
	ips TEXT NOT NULL DEFAULT '',
	traffic_cap INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS user_traffic (
	node TEXT NOT NULL REFERENCES nodes(name) ON DELETE CASCADE,
	user TEXT NOT NULL,
	last_seen TEXT NOT NULL DEFAULT '',
	rate INTEGER NOT NULL DEFAULT 0,
	uplink INTEGER NOT NULL DEFAULT 0,
	downlink INTEGER NOT NULL DEFAULT 0,
	sess_uplink INTEGER NOT NULL DEFAULT 0,
	sess_downlink INTEGER NOT NULL DEFAULT 0,
	created TEXT NOT NULL DEFAULT '',
	PRIMARY KEY (node, user)
);

CREATE TABLE IF NOT EXISTS user_credentials (
	node TEXT NOT NULL,
	user TEXT NOT NULL,
	credential TEXT NOT NULL,
	inbound_tag TEXT NOT NULL,
	PRIMARY KEY (node, user, credential, inbound_tag),
	UNIQUE (node, inbound_tag, credential),
	FOREIGN KEY (node) REFERENCES nodes(name) ON DELETE CASCADE,
	FOREIGN KEY (node, user) REFERENCES user_traffic(node, user) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS bound_traffic (
	node TEXT NOT NULL REFERENCES nodes(name) ON DELETE CASCADE,
	source TEXT NOT NULL,
	rate INTEGER NOT NULL DEFAULT 0,
	uplink INTEGER NOT NULL DEFAULT 0,
	downlink INTEGER NOT NULL DEFAULT 0,
	sess_uplink INTEGER NOT NULL DEFAULT 0,
	sess_downlink INTEGER NOT NULL DEFAULT 0,
	PRIMARY KEY (node, source)
);

-- DNS rows outlive users on purpose: they are only ever cleared by an
-- administrative reset.
CREATE TABLE IF NOT EXISTS user_dns (
	node TEXT NOT NULL,
	user TEXT NOT NULL,
	domain TEXT NOT NULL,
	count INTEGER NOT NULL DEFAULT 0,
	PRIMARY KEY (node, user, domain)
);

-- Every traffic row has a parent user row.
CREATE TRIGGER IF NOT EXISTS user_traffic_insert_user
AFTER INSERT ON user_traffic
BEGIN
	INSERT OR IGNORE INTO users (user) VALUES (NEW.user);
END;

-- Deleting the last traffic row of a user deletes the user.
CREATE TRIGGER IF NOT EXISTS user_traffic_delete_user
AFTER DELETE ON user_traffic
WHEN NOT EXISTS (SELECT 1 FROM user_traffic WHERE user = OLD.user)
BEGIN
	DELETE FROM users WHERE user = OLD.user;
END;

CREATE INDEX IF NOT EXISTS idx_user_traffic_rate ON user_traffic (rate);
CREATE INDEX IF NOT EXISTS idx_user_traffic_last_seen ON user_traffic (last_seen);
CREATE INDEX IF NOT EXISTS idx_user_traffic_created ON user_traffic (created);
CREATE INDEX IF NOT EXISTS idx_user_traffic_uplink ON user_traffic (uplink);
CREATE INDEX IF NOT EXISTS idx_user_traffic_downlink ON user_traffic (downlink);
CREATE INDEX IF NOT EXISTS idx_user_traffic_sess_uplink ON user_traffic (sess_uplink);
CREATE INDEX IF NOT EXISTS idx_user_traffic_sess_downlink ON user_traffic (sess_downlink);
CREATE INDEX IF NOT EXISTS idx_users_enabled ON users (enabled);
CREATE INDEX IF NOT EXISTS idx_users_sub_end ON users (sub_end);
CREATE INDEX IF NOT EXISTS idx_bound_traffic_rate ON bound_traffic (rate);
CREATE INDEX IF NOT EXISTS idx_user_dns_domain ON user_dns (domain);
"#;

/// Per-connection pragmas for the in-memory tier.
pub fn init_memory(conn: &Connection) -> rusqlite::Result<()> {
	conn.execute_batch(
		"PRAGMA foreign_keys = ON;
		 PRAGMA busy_timeout = 5000;",
	)?;
	conn.execute_batch(SCHEMA)
}

/// File-tier pragmas per the persisted-state contract: WAL journaling,
/// NORMAL sync, enforced foreign keys, 5 s busy timeout, 2000-page cache.
pub fn init_file(conn: &Connection) -> rusqlite::Result<()> {
	conn.execute_batch(
		"PRAGMA journal_mode = WAL;
		 PRAGMA synchronous = NORMAL;
		 PRAGMA foreign_keys = ON;
		 PRAGMA busy_timeout = 5000;
		 PRAGMA cache_size = 2000;",
	)?;
	conn.execute_batch(SCHEMA)
}

#[cfg(test)]
mod tests {
	use super::*;
	use rusqlite::params;

	fn mem() -> Connection {
		let conn = Connection::open_in_memory().unwrap();
		init_memory(&conn).unwrap();
		conn
	}

	fn seed_node(conn: &Connection) {
		conn
			.execute(
				"INSERT INTO nodes (name, address, port) VALUES ('n1', '10.0.0.1', 50051)",
				[],
			)
			.unwrap();
	}

	#[test]
	fn traffic_insert_creates_parent_user() {
		let conn = mem();
		seed_node(&conn);
		conn
			.execute(
				"INSERT INTO user_traffic (node, user) VALUES ('n1', 'alice')",
				[],
			)
			.unwrap();
		let n: i64 = conn
			.query_row("SELECT COUNT(*) FROM users WHERE user = 'alice'", [], |r| r.get(0))
			.unwrap();
		assert_eq!(n, 1);
	}

	#[test]
	fn deleting_last_traffic_row_deletes_user() {
		let conn = mem();
		seed_node(&conn);
		conn
			.execute("INSERT INTO nodes (name, address, port) VALUES ('n2', '10.0.0.2', 50051)", [])
			.unwrap();
		for node in ["n1", "n2"] {
			conn
				.execute(
					"INSERT INTO user_traffic (node, user) VALUES (?1, 'alice')",
					params![node],
				)
				.unwrap();
		}
		conn
			.execute("DELETE FROM user_traffic WHERE node = 'n1' AND user = 'alice'", [])
			.unwrap();
		let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)).unwrap();
		assert_eq!(n, 1, "user still referenced from n2");

		conn
			.execute("DELETE FROM user_traffic WHERE node = 'n2' AND user = 'alice'", [])
			.unwrap();
		let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)).unwrap();
		assert_eq!(n, 0, "last traffic row gone, user gone");
	}

	#[test]
	fn node_delete_cascades_traffic_and_credentials() {
		let conn = mem();
		seed_node(&conn);
		conn
			.execute("INSERT INTO user_traffic (node, user) VALUES ('n1', 'alice')", [])
			.unwrap();
		conn
			.execute(
				"INSERT INTO user_credentials (node, user, credential, inbound_tag)
				 VALUES ('n1', 'alice', 'uuid-1', 'vless-in')",
				[],
			)
			.unwrap();
		conn.execute("DELETE FROM nodes WHERE name = 'n1'", []).unwrap();
		let traffic: i64 = conn
			.query_row("SELECT COUNT(*) FROM user_traffic", [], |r| r.get(0))
			.unwrap();
		let creds: i64 = conn
			.query_row("SELECT COUNT(*) FROM user_credentials", [], |r| r.get(0))
			.unwrap();
		assert_eq!((traffic, creds), (0, 0));
	}

	#[test]
	fn duplicate_credential_on_inbound_is_rejected() {
		let conn = mem();
		seed_node(&conn);
		for user in ["alice", "bob"] {
			conn
				.execute(
					"INSERT INTO user_traffic (node, user) VALUES ('n1', ?1)",
					params![user],
				)
				.unwrap();
		}
		conn
			.execute(
				"INSERT INTO user_credentials (node, user, credential, inbound_tag)
				 VALUES ('n1', 'alice', 'same-cred', 'vless-in')",
				[],
			)
			.unwrap();
		let err = conn.execute(
			"INSERT INTO user_credentials (node, user, credential, inbound_tag)
			 VALUES ('n1', 'bob', 'same-cred', 'vless-in')",
			[],
		);
		assert!(err.is_err());
	}
}
