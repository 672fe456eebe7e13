// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Advisory locks serializing mutating operations across processes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::fsutil::ensure_private_dir;

/// An exclusive lock on a file next to the keys, released on drop.
#[derive(Debug)]
pub struct KeyDirLock {
	file: File,
	path: PathBuf,
}

impl KeyDirLock {
	/// Blocks until the lock is available.
	pub fn acquire(path: &Path) -> io::Result<Self> {
		let file = open_lock_file(path)?;
		file.lock_exclusive()?;
		debug!(path = %path.display(), "acquired lock");
		Ok(Self {
			file,
			path: path.to_path_buf(),
		})
	}

	/// Returns `Ok(None)` when another holder has the lock.
	pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
		let file = open_lock_file(path)?;
		match file.try_lock_exclusive() {
			Ok(()) => {
				debug!(path = %path.display(), "acquired lock");
				Ok(Some(Self {
					file,
					path: path.to_path_buf(),
				}))
			}
			Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
			Err(e) => Err(e),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for KeyDirLock {
	fn drop(&mut self) {
		if let Err(e) = FileExt::unlock(&self.file) {
			warn!(path = %self.path.display(), error = %e, "failed to release lock");
		}
	}
}

fn open_lock_file(path: &Path) -> io::Result<File> {
	if let Some(parent) = path.parent() {
		ensure_private_dir(parent)?;
	}

	let mut options = OpenOptions::new();
	options.read(true).write(true).create(true).truncate(false);
	#[cfg(unix)]
	{
		use std::os::unix::fs::OpenOptionsExt;
		options.mode(0o600);
	}
	options.open(path)
}
