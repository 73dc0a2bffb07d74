//! The dual-tier SQL store. The in-memory database is authoritative for
//! everything at runtime; the on-disk database is its durable shadow,
//! refreshed by a one-way sync (hourly, and once at shutdown).
//!
//! All access goes through one worker thread that owns the memory
//! connection. Work arrives over a channel tagged high (user mutations) or
//! low (stats); queued high-priority work always runs before queued low
//! work, which keeps command latency flat under read-heavy load.

pub mod queries;
pub mod schema;
pub mod sync;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("sql: {0}")]
	Sql(#[from] rusqlite::Error),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("store worker is gone")]
	Closed,
}

impl StoreError {
	/// True when the failure is a UNIQUE/PK violation, which command
	/// handling maps to AlreadyExists.
	pub fn is_constraint_violation(&self) -> bool {
		matches!(
			self,
			StoreError::Sql(rusqlite::Error::SqliteFailure(e, _))
				if e.code == rusqlite::ErrorCode::ConstraintViolation
		)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Priority {
	High,
	Low,
}

struct Worker {
	memory: Connection,
	file_path: PathBuf,
}

type Job = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

#[derive(Clone)]
pub struct Store {
	tx: mpsc::UnboundedSender<(Priority, Job)>,
}

impl Store {
	/// Opens both tiers, creating schema where missing, and restores the
	/// memory tier from the file tier when the file has data.
	pub fn open(db_path: &Path) -> Result<Store, StoreError> {
		let memory = Connection::open_in_memory()?;
		schema::init_memory(&memory)?;

		if let Some(dir) = db_path.parent() {
			if !dir.as_os_str().is_empty() {
				std::fs::create_dir_all(dir)?;
			}
		}
		let file = Connection::open(db_path)?;
		schema::init_file(&file)?;
		let populated: i64 = file.query_row("SELECT COUNT(*) FROM user_traffic", [], |r| r.get(0))?;
		drop(file);
		if populated > 0 {
			sync::restore_from_file(&memory, db_path)?;
			info!(rows = populated, "restored memory store from file store");
		}

		let (tx, rx) = mpsc::unbounded_channel();
		let worker = Worker {
			memory,
			file_path: db_path.to_path_buf(),
		};
		std::thread::Builder::new()
			.name("store".to_string())
			.spawn(move || run_worker(worker, rx))?;
		Ok(Store { tx })
	}

	/// User mutations; runs before any queued low-priority work.
	pub async fn high<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
		T: Send + 'static,
	{
		self.submit(Priority::High, f).await
	}

	/// Stats reads and reconciliation writes.
	pub async fn low<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
		T: Send + 'static,
	{
		self.submit(Priority::Low, f).await
	}

	async fn submit<T, F>(&self, priority: Priority, f: F) -> Result<T, StoreError>
	where
		F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
		T: Send + 'static,
	{
		let (done_tx, done_rx) = oneshot::channel();
		let job: Job = Box::new(move |worker: &mut Worker| {
			let _ = done_tx.send(f(&mut worker.memory));
		});
		self
			.tx
			.send((priority, job))
			.map_err(|_| StoreError::Closed)?;
		done_rx
			.await
			.map_err(|_| StoreError::Closed)?
			.map_err(StoreError::Sql)
	}

	/// One memory→file sync pass. File errors are the caller's to log; the
	/// memory tier is untouched either way.
	pub async fn sync_to_file(&self) -> Result<(), StoreError> {
		let (done_tx, done_rx) = oneshot::channel();
		let job: Job = Box::new(move |worker: &mut Worker| {
			let _ = done_tx.send(sync::sync_to_file(&mut worker.memory, &worker.file_path));
		});
		self
			.tx
			.send((Priority::High, job))
			.map_err(|_| StoreError::Closed)?;
		done_rx
			.await
			.map_err(|_| StoreError::Closed)?
			.map_err(StoreError::Sql)
	}
}

fn run_worker(mut worker: Worker, mut rx: mpsc::UnboundedReceiver<(Priority, Job)>) {
	let mut high = VecDeque::new();
	let mut low = VecDeque::new();
	loop {
		// Pull in everything that queued up while the last job ran.
		loop {
			match rx.try_recv() {
				Ok((Priority::High, job)) => high.push_back(job),
				Ok((Priority::Low, job)) => low.push_back(job),
				Err(TryRecvError::Empty) => break,
				Err(TryRecvError::Disconnected) => break,
			}
		}
		if let Some(job) = high.pop_front() {
			job(&mut worker);
			continue;
		}
		if let Some(job) = low.pop_front() {
			job(&mut worker);
			continue;
		}
		// Idle until something arrives.
		match rx.blocking_recv() {
			Some((Priority::High, job)) => high.push_back(job),
			Some((Priority::Low, job)) => low.push_back(job),
			None => break,
		}
	}
	if let Err(e) = sync::sync_to_file(&mut worker.memory, &worker.file_path) {
		warn!(err = %e, "final store sync failed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn high_and_low_both_execute() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(&dir.path().join("data.db")).unwrap();
		store
			.high(|conn| {
				conn.execute(
					"INSERT INTO nodes (name, address, port) VALUES ('n1', '10.0.0.1', 1)",
					[],
				)
			})
			.await
			.unwrap();
		let count: i64 = store
			.low(|conn| conn.query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0)))
			.await
			.unwrap();
		assert_eq!(count, 1);
	}

	#[tokio::test]
	async fn restore_picks_up_previous_file_state() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("data.db");
		{
			let store = Store::open(&path).unwrap();
			store
				.high(|conn| {
					conn.execute(
						"INSERT INTO nodes (name, address, port) VALUES ('n1', '10.0.0.1', 1)",
						[],
					)?;
					conn.execute("INSERT INTO user_traffic (node, user) VALUES ('n1', 'alice')", [])
				})
				.await
				.unwrap();
			store.sync_to_file().await.unwrap();
		}
		let store = Store::open(&path).unwrap();
		let users: i64 = store
			.low(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)))
			.await
			.unwrap();
		assert_eq!(users, 1);
	}

	#[tokio::test]
	async fn constraint_violation_is_detectable() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(&dir.path().join("data.db")).unwrap();
		store
			.high(|conn| {
				conn.execute(
					"INSERT INTO nodes (name, address, port) VALUES ('n1', '10.0.0.1', 1)",
					[],
				)
			})
			.await
			.unwrap();
		let err = store
			.high(|conn| {
				conn.execute(
					"INSERT INTO nodes (name, address, port) VALUES ('n1', '10.0.0.1', 1)",
					[],
				)
			})
			.await
			.unwrap_err();
		assert!(err.is_constraint_violation());
	}
}
