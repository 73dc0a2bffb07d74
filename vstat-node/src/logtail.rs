//! Access-log ingestion. The tailer remembers a byte offset into the log,
//! reads only what was appended since the previous poll, and aggregates
//! observed source IPs and destination hosts per user. Historic content at
//! startup is skipped by seeking straight to end-of-file.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::{debug, warn};

const TRUNCATE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogData {
	pub ips: BTreeSet<String>,
	/// Destination host counts; multiplicity is preserved.
	pub dns: HashMap<String, u64>,
}

enum LineForm {
	/// `(source_ip, destination_host, user)`
	Full,
	/// `(user, source_ip)`
	Login,
}

pub struct LogTailer {
	path: PathBuf,
	pattern: Regex,
	form: LineForm,
	offset: u64,
	last_truncate: SystemTime,
}

impl LogTailer {
	/// The pattern must expose either three capture groups
	/// `(source_ip, destination_host, user)` or two `(user, source_ip)`.
	pub fn new(path: impl Into<PathBuf>, pattern: Regex) -> io::Result<LogTailer> {
		let form = match pattern.captures_len() {
			4 => LineForm::Full,
			3 => LineForm::Login,
			n => {
				return Err(io::Error::new(
					io::ErrorKind::InvalidInput,
					format!("access-log pattern must have 2 or 3 capture groups, has {}", n - 1),
				));
			},
		};
		let path = path.into();
		// Skip whatever the log accumulated before we started.
		let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
		Ok(LogTailer {
			path,
			pattern,
			form,
			offset,
			last_truncate: SystemTime::now(),
		})
	}

	/// Read from the stored offset to the current end and aggregate per
	/// user. Non-matching lines are dropped without comment.
	pub fn poll(&mut self) -> io::Result<HashMap<String, LogData>> {
		let mut file = match std::fs::File::open(&self.path) {
			Ok(f) => f,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				self.offset = 0;
				return Ok(HashMap::new());
			},
			Err(e) => return Err(e),
		};
		let len = file.metadata()?.len();
		if len < self.offset {
			// Rotated or truncated underneath us.
			self.offset = 0;
		}
		file.seek(SeekFrom::Start(self.offset))?;
		let mut chunk = String::new();
		file.take(len - self.offset).read_to_string(&mut chunk)?;
		self.offset = len;
		// A partially written trailing line is re-read on the next poll.
		if !chunk.ends_with('\n') {
			if let Some(cut) = chunk.rfind('\n') {
				self.offset -= (chunk.len() - cut - 1) as u64;
				chunk.truncate(cut + 1);
			} else {
				self.offset -= chunk.len() as u64;
				chunk.clear();
			}
		}

		let mut out: HashMap<String, LogData> = HashMap::new();
		for line in chunk.lines() {
			let Some(caps) = self.pattern.captures(line) else {
				continue;
			};
			match self.form {
				LineForm::Full => {
					let (ip, host, user) = (&caps[1], &caps[2], &caps[3]);
					let entry = out.entry(user.to_string()).or_default();
					entry.ips.insert(ip.to_string());
					*entry.dns.entry(host.to_string()).or_insert(0) += 1;
				},
				LineForm::Login => {
					let (user, ip) = (&caps[1], &caps[2]);
					out.entry(user.to_string()).or_default().ips.insert(ip.to_string());
				},
			}
		}
		Ok(out)
	}

	/// Once a day the log file is emptied to bound disk use. Best effort:
	/// a failure is logged and ignored.
	pub fn maybe_truncate(&mut self) {
		let due = self
			.last_truncate
			.elapsed()
			.map(|e| e >= TRUNCATE_EVERY)
			.unwrap_or(false);
		if !due {
			return;
		}
		self.last_truncate = SystemTime::now();
		match std::fs::OpenOptions::new().write(true).open(&self.path) {
			Ok(file) => match file.set_len(0) {
				Ok(()) => {
					self.offset = 0;
					debug!(path = %self.path.display(), "access log truncated");
				},
				Err(e) => warn!(path = %self.path.display(), err = %e, "access log truncation failed"),
			},
			Err(e) => warn!(path = %self.path.display(), err = %e, "access log truncation failed"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	const FULL: &str = r"from (\S+?):\d+ accepted \w+:([\w.\-]+):\d+.*email: (\S+)";
	const LOGIN: &str = r"login user=(\S+) ip=(\S+)";

	fn append(path: &std::path::Path, line: &str) {
		let mut f = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.unwrap();
		writeln!(f, "{line}").unwrap();
	}

	#[test]
	fn historic_lines_are_skipped() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("access.log");
		append(&path, "from 10.0.0.1:1 accepted tcp:old.example:443 email: alice");
		let mut tailer = LogTailer::new(&path, Regex::new(FULL).unwrap()).unwrap();
		assert!(tailer.poll().unwrap().is_empty());
	}

	#[test]
	fn full_form_collects_ips_and_dns_counts() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("access.log");
		std::fs::write(&path, "").unwrap();
		let mut tailer = LogTailer::new(&path, Regex::new(FULL).unwrap()).unwrap();

		append(&path, "from 10.0.0.1:51332 accepted tcp:example.com:443 email: alice");
		append(&path, "from 10.0.0.2:51333 accepted tcp:example.com:443 email: alice");
		append(&path, "from 10.0.0.1:51334 accepted udp:foo.bar:53 email: alice");
		append(&path, "garbage that matches nothing");

		let out = tailer.poll().unwrap();
		let alice = &out["alice"];
		assert_eq!(alice.ips.len(), 2);
		assert_eq!(alice.dns["example.com"], 2);
		assert_eq!(alice.dns["foo.bar"], 1);

		// Nothing new: next poll is empty.
		assert!(tailer.poll().unwrap().is_empty());
	}

	#[test]
	fn login_form_collects_ips_only() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("access.log");
		std::fs::write(&path, "").unwrap();
		let mut tailer = LogTailer::new(&path, Regex::new(LOGIN).unwrap()).unwrap();

		append(&path, "login user=bob ip=192.0.2.9");
		let out = tailer.poll().unwrap();
		assert!(out["bob"].ips.contains("192.0.2.9"));
		assert!(out["bob"].dns.is_empty());
	}

	#[test]
	fn partial_trailing_line_is_reread() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("access.log");
		std::fs::write(&path, "").unwrap();
		let mut tailer = LogTailer::new(&path, Regex::new(LOGIN).unwrap()).unwrap();

		let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
		write!(f, "login user=bob ").unwrap();
		assert!(tailer.poll().unwrap().is_empty());
		writeln!(f, "ip=192.0.2.9").unwrap();
		let out = tailer.poll().unwrap();
		assert!(out["bob"].ips.contains("192.0.2.9"));
	}

	#[test]
	fn rotation_resets_offset() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("access.log");
		std::fs::write(&path, "historic content\n".repeat(50)).unwrap();
		let mut tailer = LogTailer::new(&path, Regex::new(LOGIN).unwrap()).unwrap();

		// Replaced with a shorter file, as logrotate would.
		std::fs::write(&path, "login user=bob ip=192.0.2.9\n").unwrap();
		let out = tailer.poll().unwrap();
		assert!(out.contains_key("bob"));
	}

	#[test]
	fn wrong_group_count_is_rejected() {
		assert!(LogTailer::new("/tmp/x", Regex::new(r"(\S+)").unwrap()).is_err());
	}
}
