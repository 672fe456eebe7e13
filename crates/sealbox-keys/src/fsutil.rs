// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash-safe file writes for key material and the registry manifest.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::OsRng;
use rand::RngCore;

/// Mode for key files and the registry manifest.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Mode for the key directory.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Creates `dir` (and parents) with mode 0700 if it is missing. Existing
/// directories are left alone; repairing them is the permission guard's job.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
	if dir.as_os_str().is_empty() || dir.is_dir() {
		return Ok(());
	}

	let mut builder = fs::DirBuilder::new();
	builder.recursive(true);
	#[cfg(unix)]
	{
		use std::os::unix::fs::DirBuilderExt;
		builder.mode(PRIVATE_DIR_MODE);
	}
	builder.create(dir)
}

fn private_options() -> OpenOptions {
	let mut options = OpenOptions::new();
	options.write(true);
	#[cfg(unix)]
	{
		use std::os::unix::fs::OpenOptionsExt;
		options.mode(PRIVATE_FILE_MODE);
	}
	options
}

fn temp_sibling(path: &Path) -> PathBuf {
	let mut suffix = [0u8; 6];
	OsRng.fill_bytes(&mut suffix);
	let name = path
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_default();
	path.with_file_name(format!(
		".{name}.{}.{}.tmp",
		std::process::id(),
		hex::encode(suffix)
	))
}

/// Publishes `contents` at `path` only if nothing exists there yet.
///
/// The bytes go to a uniquely named temp file first and are then hard-linked
/// into place, so a concurrent reader or writer sees either no file or the
/// complete one. Fails with `AlreadyExists` if `path` is taken.
pub fn create_new_file(path: &Path, contents: &[u8]) -> io::Result<()> {
	let temp = temp_sibling(path);
	let result = write_then_link(&temp, path, contents);
	let _ = fs::remove_file(&temp);
	result?;

	if let Some(parent) = path.parent() {
		sync_dir(parent)?;
	}
	Ok(())
}

fn write_then_link(temp: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
	let mut file = private_options().create_new(true).open(temp)?;
	file.write_all(contents)?;
	file.sync_all()?;
	drop(file);

	fs::hard_link(temp, path)
}

/// Replaces `path` with `contents` using write-temp, fsync, rename, fsync-dir.
pub fn replace_file(path: &Path, contents: &[u8]) -> io::Result<()> {
	let temp = temp_sibling(path);

	let written = (|| {
		let mut file = private_options().create_new(true).open(&temp)?;
		file.write_all(contents)?;
		file.sync_all()?;
		drop(file);
		fs::rename(&temp, path)
	})();

	if written.is_err() {
		let _ = fs::remove_file(&temp);
	}
	written?;

	if let Some(parent) = path.parent() {
		sync_dir(parent)?;
	}
	Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
	let dir = if dir.as_os_str().is_empty() {
		Path::new(".")
	} else {
		dir
	};
	File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_new_file_refuses_to_overwrite() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dek.key");

		create_new_file(&path, b"first").unwrap();
		let err = create_new_file(&path, b"second").unwrap_err();

		assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
		assert_eq!(fs::read(&path).unwrap(), b"first");
	}

	#[test]
	fn create_new_file_leaves_no_temp_files() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("kek.key");

		create_new_file(&path, b"data").unwrap();
		let _ = create_new_file(&path, b"data");

		let names: Vec<_> = fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name())
			.collect();
		assert_eq!(names, vec![std::ffi::OsString::from("kek.key")]);
	}

	#[test]
	fn replace_file_overwrites() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("keys.json");

		replace_file(&path, b"{}").unwrap();
		replace_file(&path, b"{\"a\":1}").unwrap();
		assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
	}

	#[cfg(unix)]
	#[test]
	fn written_files_are_private() {
		use std::os::unix::fs::PermissionsExt;

		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("kek.key");
		create_new_file(&path, b"secret").unwrap();

		let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode, 0o600);
	}

	#[cfg(unix)]
	#[test]
	fn ensure_private_dir_creates_0700() {
		use std::os::unix::fs::PermissionsExt;

		let dir = tempfile::tempdir().unwrap();
		let keys = dir.path().join("a").join("keys");
		ensure_private_dir(&keys).unwrap();

		let mode = fs::metadata(&keys).unwrap().permissions().mode() & 0o777;
		assert_eq!(mode, 0o700);
	}
}
