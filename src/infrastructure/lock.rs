//! Group lock file.
//!
//! One process synchronizes a group at a time. The lock is a small
//! JSON file in the group's config directory naming the owning process;
//! a lock whose owner is no longer alive is stale and signals that the
//! previous run ended uncleanly, which forces a slow sync.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// How acquisition went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
	/// No previous lock existed
	Ok,
	/// A lock file from a dead process was replaced
	Stale,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
	pid: u32,
	started_at: DateTime<Utc>,
}

impl LockInfo {
	fn current() -> Self {
		Self {
			pid: std::process::id(),
			started_at: Utc::now(),
		}
	}
}

#[derive(Debug)]
pub struct GroupLock {
	path: PathBuf,
}

impl GroupLock {
	/// Acquire the lock, failing with `Locked` while another live
	/// process holds it.
	pub fn acquire(path: &Path) -> SyncResult<(Self, LockState)> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}

		let mut state = LockState::Ok;

		match fs::OpenOptions::new().write(true).create_new(true).open(path) {
			Ok(file) => {
				serde_json::to_writer(file, &LockInfo::current())
					.map_err(|e| SyncError::generic(format!("unwritable lock file: {e}")))?;
			}
			Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
				let owner = fs::read_to_string(path)
					.ok()
					.and_then(|raw| serde_json::from_str::<LockInfo>(&raw).ok());

				match owner {
					Some(info) if info.pid != std::process::id() && process_alive(info.pid) => {
						return Err(SyncError::locked(format!(
							"group is locked by running process {} since {}",
							info.pid, info.started_at
						)));
					}
					_ => {
						warn!("replacing stale lock at {}", path.display());
						let raw = serde_json::to_string(&LockInfo::current())
							.map_err(|e| SyncError::generic(format!("unwritable lock file: {e}")))?;
						fs::write(path, raw)?;
						state = LockState::Stale;
					}
				}
			}
			Err(err) => return Err(err.into()),
		}

		Ok((
			Self {
				path: path.to_path_buf(),
			},
			state,
		))
	}

	/// Remove the lock file. Not called when a run ends in error, so
	/// the next run detects the unclean end.
	pub fn release(self) -> SyncResult<()> {
		fs::remove_file(&self.path)?;
		Ok(())
	}
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
	// Signal 0 probes for existence without delivering anything. EPERM
	// still means the process exists.
	let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
	ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
	false
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn write_lock(path: &Path, pid: u32) {
		let info = LockInfo {
			pid,
			started_at: Utc::now(),
		};
		fs::write(path, serde_json::to_string(&info).unwrap()).unwrap();
	}

	#[test]
	fn acquire_release_cycle() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("lock");

		let (lock, state) = GroupLock::acquire(&path).unwrap();
		assert_eq!(state, LockState::Ok);
		assert!(path.exists());

		lock.release().unwrap();
		assert!(!path.exists());
	}

	#[cfg(unix)]
	#[test]
	fn live_foreign_owner_blocks_acquire() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("lock");

		// pid 1 is always alive on unix.
		write_lock(&path, 1);

		let err = GroupLock::acquire(&path).unwrap_err();
		assert_eq!(err.kind(), crate::error::ErrorKind::Locked);
	}

	#[test]
	fn own_pid_reads_as_stale() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("lock");

		// A lock we left behind ourselves means the previous run in
		// this process never finalized.
		write_lock(&path, std::process::id());

		let (lock, state) = GroupLock::acquire(&path).unwrap();
		assert_eq!(state, LockState::Stale);
		lock.release().unwrap();
	}

	#[test]
	fn dead_owner_is_stale() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("lock");

		// No process gets pid 0 on any platform we run on.
		write_lock(&path, 0);

		let (lock, state) = GroupLock::acquire(&path).unwrap();
		assert_eq!(state, LockState::Stale);
		lock.release().unwrap();
	}

	#[test]
	fn unreadable_lock_content_reads_as_stale() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("lock");

		fs::write(&path, "not json").unwrap();

		let (lock, state) = GroupLock::acquire(&path).unwrap();
		assert_eq!(state, LockState::Stale);
		lock.release().unwrap();
	}
}
