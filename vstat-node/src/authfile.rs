//! Maintenance of the external auth file consumed by the HTTP proxy's lua
//! auth hook. One `user:secret` line per credential; Trojan credentials are
//! stored as the SHA-224 hex of the plaintext password, VLESS credentials
//! as the raw UUID. The proxy-core config keeps the plaintext; both
//! representations must stay in sync.

use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha224};

use crate::corecfg::Protocol;

pub struct AuthFile {
	path: PathBuf,
}

impl AuthFile {
	pub fn new(path: impl Into<PathBuf>) -> AuthFile {
		AuthFile { path: path.into() }
	}

	pub fn entry_secret(protocol: Protocol, credential: &str) -> String {
		match protocol {
			Protocol::Trojan => hex::encode(Sha224::digest(credential.as_bytes())),
			Protocol::Vless => credential.to_string(),
		}
	}

	/// Append one entry per `(user, credential)` pair.
	pub fn add(&self, entries: &[(String, String)], protocol: Protocol) -> io::Result<()> {
		let mut lines = self.read_lines()?;
		for (user, credential) in entries {
			lines.push(format!("{user}:{}", Self::entry_secret(protocol, credential)));
		}
		self.write_lines(&lines)
	}

	/// Drop every entry belonging to the named users.
	pub fn remove(&self, users: &[String]) -> io::Result<()> {
		let lines = self.read_lines()?;
		let kept: Vec<String> = lines
			.into_iter()
			.filter(|line| {
				let name = line.split(':').next().unwrap_or_default();
				!users.iter().any(|u| u == name)
			})
			.collect();
		self.write_lines(&kept)
	}

	fn read_lines(&self) -> io::Result<Vec<String>> {
		match std::fs::read_to_string(&self.path) {
			Ok(contents) => Ok(
				contents
					.lines()
					.filter(|l| !l.trim().is_empty())
					.map(str::to_string)
					.collect(),
			),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(e),
		}
	}

	fn write_lines(&self, lines: &[String]) -> io::Result<()> {
		let mut contents = lines.join("\n");
		if !contents.is_empty() {
			contents.push('\n');
		}
		let tmp = tmp_path(&self.path);
		std::fs::write(&tmp, contents)?;
		std::fs::rename(&tmp, &self.path)
	}
}

fn tmp_path(path: &Path) -> PathBuf {
	path.with_extension("tmp")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn trojan_secret_is_sha224_hex() {
		let secret = AuthFile::entry_secret(Protocol::Trojan, "password123");
		// SHA-224 digests render as 56 hex chars.
		assert_eq!(secret.len(), 56);
		assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
		// Deterministic.
		assert_eq!(secret, AuthFile::entry_secret(Protocol::Trojan, "password123"));
	}

	#[test]
	fn vless_secret_is_raw() {
		let uuid = "6c64b236-ad8a-4b44-a97c-7c7a4b1f8a60";
		assert_eq!(AuthFile::entry_secret(Protocol::Vless, uuid), uuid);
	}

	#[test]
	fn add_then_remove_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let auth = AuthFile::new(dir.path().join("auth.lst"));
		auth
			.add(
				&[("alice".into(), "s3cret".into()), ("bob".into(), "hunter2".into())],
				Protocol::Trojan,
			)
			.unwrap();
		auth.remove(&["alice".into()]).unwrap();

		let contents = std::fs::read_to_string(dir.path().join("auth.lst")).unwrap();
		assert!(!contents.contains("alice"));
		assert!(contents.starts_with("bob:"));
	}
}
