//! Row copies between the two tiers. Both directions ATTACH the file
//! database to the memory connection and move rows with plain SQL, so the
//! whole pass is one transaction and the file ends up an exact snapshot.

use std::path::Path;

use rusqlite::{Connection, params};

use super::schema;

/// Tables with their primary-key columns, in upsert order; deletions run
/// in reverse. `users` must come after `user_traffic`: an upsert-REPLACE
/// of a traffic row fires the user-reaper trigger, and the users copy
/// afterwards restores the real column values.
const KEYED_TABLES: &[(&str, &str)] = &[
	("nodes", "name"),
	("user_traffic", "node, user"),
	("users", "user"),
	("user_credentials", "node, user, credential, inbound_tag"),
	("bound_traffic", "node, source"),
	("user_dns", "node, user, domain"),
];

/// One-shot startup restore: upsert every file row into memory.
pub fn restore_from_file(memory: &Connection, file_path: &Path) -> rusqlite::Result<()> {
	attach(memory, file_path)?;
	let result = (|| {
		for (table, _) in KEYED_TABLES {
			memory.execute(
				&format!("INSERT OR REPLACE INTO main.{table} SELECT * FROM disk.{table}"),
				[],
			)?;
		}
		Ok(())
	})();
	detach(memory, result)
}

/// Memory→file sync: upsert all memory rows, delete file rows that no
/// longer exist in memory. If the file vanished (operator action), it is
/// recreated with schema first.
pub fn sync_to_file(memory: &mut Connection, file_path: &Path) -> rusqlite::Result<()> {
	if !file_path.exists() {
		let file = Connection::open(file_path)?;
		schema::init_file(&file)?;
	}
	attach(memory, file_path)?;
	let result = copy_snapshot(memory);
	detach(memory, result)
}

fn copy_snapshot(memory: &mut Connection) -> rusqlite::Result<()> {
	let tx = memory.transaction()?;
	for (table, keys) in KEYED_TABLES.iter().rev() {
		tx.execute(
			&format!(
				"DELETE FROM disk.{table} WHERE ({keys}) NOT IN (SELECT {keys} FROM main.{table})"
			),
			[],
		)?;
	}
	for (table, _) in KEYED_TABLES {
		tx.execute(
			&format!("INSERT OR REPLACE INTO disk.{table} SELECT * FROM main.{table}"),
			[],
		)?;
	}
	tx.commit()
}

fn attach(conn: &Connection, file_path: &Path) -> rusqlite::Result<()> {
	conn.execute(
		"ATTACH DATABASE ?1 AS disk",
		params![file_path.to_string_lossy().into_owned()],
	)?;
	conn.execute_batch("PRAGMA disk.synchronous = NORMAL;")
}

fn detach(conn: &Connection, result: rusqlite::Result<()>) -> rusqlite::Result<()> {
	let detached = conn.execute("DETACH DATABASE disk", []).map(|_| ());
	result.and(detached)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn memory() -> Connection {
		let conn = Connection::open_in_memory().unwrap();
		schema::init_memory(&conn).unwrap();
		conn
	}

	fn seed(conn: &Connection) {
		conn
			.execute_batch(
				"INSERT INTO nodes (name, address, port) VALUES ('n1', '10.0.0.1', 1);
				 INSERT INTO user_traffic (node, user, uplink) VALUES ('n1', 'alice', 100);
				 INSERT INTO user_credentials (node, user, credential, inbound_tag)
					VALUES ('n1', 'alice', 'uuid-1', 'vless-in');",
			)
			.unwrap();
	}

	#[test]
	fn sync_then_restore_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.db");
		let mut mem = memory();
		seed(&mem);
		sync_to_file(&mut mem, &path).unwrap();

		let fresh = memory();
		restore_from_file(&fresh, &path).unwrap();
		let uplink: i64 = fresh
			.query_row(
				"SELECT uplink FROM user_traffic WHERE node = 'n1' AND user = 'alice'",
				[],
				|r| r.get(0),
			)
			.unwrap();
		assert_eq!(uplink, 100);
		let creds: i64 = fresh
			.query_row("SELECT COUNT(*) FROM user_credentials", [], |r| r.get(0))
			.unwrap();
		assert_eq!(creds, 1);
	}

	#[test]
	fn rows_absent_from_memory_are_removed_from_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.db");
		let mut mem = memory();
		seed(&mem);
		sync_to_file(&mut mem, &path).unwrap();

		mem
			.execute("DELETE FROM user_traffic WHERE node = 'n1' AND user = 'alice'", [])
			.unwrap();
		sync_to_file(&mut mem, &path).unwrap();

		let file = Connection::open(&path).unwrap();
		let traffic: i64 = file
			.query_row("SELECT COUNT(*) FROM user_traffic", [], |r| r.get(0))
			.unwrap();
		let users: i64 = file.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)).unwrap();
		assert_eq!((traffic, users), (0, 0));
	}

	#[test]
	fn deleted_file_is_recreated() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.db");
		let mut mem = memory();
		seed(&mem);
		sync_to_file(&mut mem, &path).unwrap();
		std::fs::remove_file(&path).unwrap();

		sync_to_file(&mut mem, &path).unwrap();
		let file = Connection::open(&path).unwrap();
		let n: i64 = file.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0)).unwrap();
		assert_eq!(n, 1);
	}
}
