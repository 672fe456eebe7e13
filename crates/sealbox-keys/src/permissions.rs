// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Audit and repair of file modes and ownership for key material and other
//! sensitive files.
//!
//! Files are expected at 0600 and directories at 0700. [`FilePermissionGuard::fix`]
//! only ever clears mode bits, so it can tighten but never widen access.
//! Only metadata is inspected; file contents are never read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::PermissionError;
use crate::fsutil::{PRIVATE_DIR_MODE, PRIVATE_FILE_MODE};

/// One way a path deviates from what is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum PermissionIssue {
	Missing,
	/// The path exists or might, but its metadata could not be read.
	Inaccessible { os_error: Option<i32> },
	NotRegularFile,
	ModeTooPermissive { actual: u32, expected: u32 },
	OwnerMismatch { actual: u32, expected: u32 },
}

/// Expected vs actual metadata for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionFinding {
	pub path: PathBuf,
	pub is_dir: bool,
	pub expected_mode: u32,
	pub actual_mode: Option<u32>,
	pub expected_uid: Option<u32>,
	pub actual_uid: Option<u32>,
	pub issues: Vec<PermissionIssue>,
}

impl PermissionFinding {
	pub fn is_ok(&self) -> bool {
		self.issues.is_empty()
	}

	/// True when the path exists but has some issue.
	pub fn is_violation(&self) -> bool {
		self.issues
			.iter()
			.any(|issue| !matches!(issue, PermissionIssue::Missing))
	}
}

/// Result of auditing a set of paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionReport {
	pub findings: Vec<PermissionFinding>,
}

impl PermissionReport {
	/// No existing path has a mode or ownership problem.
	pub fn is_clean(&self) -> bool {
		!self.findings.iter().any(PermissionFinding::is_violation)
	}

	pub fn violations(&self) -> impl Iterator<Item = &PermissionFinding> {
		self.findings.iter().filter(|f| f.is_violation())
	}

	pub fn missing(&self) -> impl Iterator<Item = &PermissionFinding> {
		self.findings
			.iter()
			.filter(|f| f.issues.contains(&PermissionIssue::Missing))
	}

	pub fn finding(&self, path: &Path) -> Option<&PermissionFinding> {
		self.findings.iter().find(|f| f.path == path)
	}
}

/// Checks and tightens modes and ownership of sensitive paths.
#[derive(Debug, Clone)]
pub struct FilePermissionGuard {
	configured_owner: Option<u32>,
}

impl FilePermissionGuard {
	/// `owner_uid` of `None` expects the effective uid of this process and
	/// never changes ownership in [`fix`](Self::fix).
	pub fn new(owner_uid: Option<u32>) -> Self {
		Self {
			configured_owner: owner_uid,
		}
	}

	pub fn expected_uid(&self) -> Option<u32> {
		self.configured_owner.or_else(effective_uid)
	}

	pub fn expected_mode(is_dir: bool) -> u32 {
		if is_dir {
			PRIVATE_DIR_MODE
		} else {
			PRIVATE_FILE_MODE
		}
	}

	#[instrument(skip_all, fields(paths = paths.len()))]
	pub fn audit(&self, paths: &[PathBuf]) -> PermissionReport {
		let findings: Vec<_> = paths.iter().map(|p| self.inspect(p)).collect();
		let violations = findings.iter().filter(|f| f.is_violation()).count();
		debug!(violations, "permission audit complete");
		PermissionReport { findings }
	}

	pub fn inspect(&self, path: &Path) -> PermissionFinding {
		let expected_uid = self.expected_uid();
		let metadata = match fs::metadata(path) {
			Ok(metadata) => metadata,
			Err(e) => {
				let issue = if e.kind() == io::ErrorKind::NotFound {
					PermissionIssue::Missing
				} else {
					warn!(path = %path.display(), error = %e, "cannot read metadata");
					PermissionIssue::Inaccessible {
						os_error: e.raw_os_error(),
					}
				};
				return PermissionFinding {
					path: path.to_path_buf(),
					is_dir: false,
					expected_mode: PRIVATE_FILE_MODE,
					actual_mode: None,
					expected_uid,
					actual_uid: None,
					issues: vec![issue],
				};
			}
		};

		let is_dir = metadata.is_dir();
		let expected_mode = Self::expected_mode(is_dir);
		let (actual_mode, actual_uid) = mode_and_owner(&metadata);

		let mut issues = Vec::new();
		if !is_dir && !metadata.is_file() {
			issues.push(PermissionIssue::NotRegularFile);
		}
		if let Some(actual) = actual_mode {
			if actual & !expected_mode != 0 {
				issues.push(PermissionIssue::ModeTooPermissive {
					actual,
					expected: expected_mode,
				});
			}
		}
		if let (Some(actual), Some(expected)) = (actual_uid, expected_uid) {
			if actual != expected {
				issues.push(PermissionIssue::OwnerMismatch { actual, expected });
			}
		}

		PermissionFinding {
			path: path.to_path_buf(),
			is_dir,
			expected_mode,
			actual_mode,
			expected_uid,
			actual_uid,
			issues,
		}
	}

	/// Clears every mode bit outside the expected mask and, when an owner is
	/// configured, chowns to it. Missing paths are skipped. Idempotent.
	#[instrument(skip_all, fields(paths = paths.len()))]
	pub fn fix(&self, paths: &[PathBuf]) -> Result<(), PermissionError> {
		for path in paths {
			self.fix_one(path)?;
		}
		Ok(())
	}

	#[cfg(unix)]
	fn fix_one(&self, path: &Path) -> Result<(), PermissionError> {
		use std::os::unix::fs::{MetadataExt, PermissionsExt};

		let metadata = match fs::metadata(path) {
			Ok(metadata) => metadata,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				debug!(path = %path.display(), "skipping missing path");
				return Ok(());
			}
			Err(source) => {
				return Err(PermissionError::Io {
					path: path.to_path_buf(),
					source,
				})
			}
		};

		let mode = metadata.permissions().mode() & 0o7777;
		let tightened = mode & Self::expected_mode(metadata.is_dir());
		if tightened != mode {
			fs::set_permissions(path, fs::Permissions::from_mode(tightened)).map_err(|source| {
				PermissionError::Io {
					path: path.to_path_buf(),
					source,
				}
			})?;
			info!(
				path = %path.display(),
				from = format_args!("{mode:04o}"),
				to = format_args!("{tightened:04o}"),
				"tightened permissions"
			);
		}

		if let Some(uid) = self.configured_owner {
			if metadata.uid() != uid {
				std::os::unix::fs::chown(path, Some(uid), None).map_err(|source| {
					PermissionError::Ownership {
						path: path.to_path_buf(),
						uid,
						source,
					}
				})?;
				info!(path = %path.display(), uid, "changed owner");
			}
		}

		Ok(())
	}

	#[cfg(not(unix))]
	fn fix_one(&self, path: &Path) -> Result<(), PermissionError> {
		debug!(path = %path.display(), "permission repair unsupported on this platform");
		Ok(())
	}
}

impl Default for FilePermissionGuard {
	fn default() -> Self {
		Self::new(None)
	}
}

#[cfg(unix)]
fn mode_and_owner(metadata: &fs::Metadata) -> (Option<u32>, Option<u32>) {
	use std::os::unix::fs::{MetadataExt, PermissionsExt};
	(
		Some(metadata.permissions().mode() & 0o7777),
		Some(metadata.uid()),
	)
}

#[cfg(not(unix))]
fn mode_and_owner(_metadata: &fs::Metadata) -> (Option<u32>, Option<u32>) {
	(None, None)
}

#[cfg(unix)]
fn effective_uid() -> Option<u32> {
	// SAFETY: geteuid has no preconditions and cannot fail.
	Some(unsafe { libc::geteuid() })
}

#[cfg(not(unix))]
fn effective_uid() -> Option<u32> {
	None
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use std::os::unix::fs::PermissionsExt;

	fn write_with_mode(path: &Path, mode: u32) {
		fs::write(path, [0u8; 32]).unwrap();
		fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
	}

	fn mode_of(path: &Path) -> u32 {
		fs::metadata(path).unwrap().permissions().mode() & 0o7777
	}

	#[test]
	fn audit_flags_loose_modes() {
		let dir = tempfile::tempdir().unwrap();
		let loose = dir.path().join("kek.key");
		let tight = dir.path().join("dek.key");
		write_with_mode(&loose, 0o644);
		write_with_mode(&tight, 0o600);

		let report = FilePermissionGuard::default().audit(&[loose.clone(), tight.clone()]);

		assert!(!report.is_clean());
		let finding = report.finding(&loose).unwrap();
		assert_eq!(
			finding.issues,
			vec![PermissionIssue::ModeTooPermissive {
				actual: 0o644,
				expected: 0o600
			}]
		);
		assert!(report.finding(&tight).unwrap().is_ok());
		assert_eq!(report.violations().count(), 1);
	}

	#[test]
	fn stricter_modes_are_not_violations() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dek.key");
		write_with_mode(&path, 0o400);

		let report = FilePermissionGuard::default().audit(&[path]);
		assert!(report.is_clean());
	}

	#[test]
	fn missing_paths_are_reported_but_not_violations() {
		let dir = tempfile::tempdir().unwrap();
		let report = FilePermissionGuard::default().audit(&[dir.path().join("absent.key")]);

		assert!(report.is_clean());
		assert_eq!(report.missing().count(), 1);
	}

	#[test]
	fn unreadable_metadata_is_a_violation() {
		let dir = tempfile::tempdir().unwrap();
		let file = dir.path().join("kek.key");
		write_with_mode(&file, 0o600);
		let beneath_file = file.join("dek.key");

		let report = FilePermissionGuard::default().audit(&[beneath_file.clone()]);

		assert!(!report.is_clean());
		assert_eq!(report.missing().count(), 0);
		assert!(matches!(
			report.finding(&beneath_file).unwrap().issues[..],
			[PermissionIssue::Inaccessible { os_error: Some(_) }]
		));
	}

	#[test]
	fn audit_reports_owner_mismatch() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("kek.key");
		write_with_mode(&path, 0o600);

		let other_uid = effective_uid().unwrap().wrapping_add(1);
		let report = FilePermissionGuard::new(Some(other_uid)).audit(&[path.clone()]);

		assert!(report
			.finding(&path)
			.unwrap()
			.issues
			.iter()
			.any(|i| matches!(i, PermissionIssue::OwnerMismatch { .. })));
	}

	#[test]
	fn fix_tightens_and_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let key = dir.path().join("kek.key");
		let sub = dir.path().join("keys");
		write_with_mode(&key, 0o664);
		fs::create_dir(&sub).unwrap();
		fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();

		let guard = FilePermissionGuard::default();
		let paths = vec![key.clone(), sub.clone()];

		guard.fix(&paths).unwrap();
		assert_eq!(mode_of(&key), 0o600);
		assert_eq!(mode_of(&sub), 0o700);
		assert!(guard.audit(&paths).is_clean());

		guard.fix(&paths).unwrap();
		assert_eq!(mode_of(&key), 0o600);
		assert_eq!(mode_of(&sub), 0o700);
	}

	#[test]
	fn fix_never_widens() {
		let dir = tempfile::tempdir().unwrap();
		let key = dir.path().join("dek.key");
		write_with_mode(&key, 0o400);

		FilePermissionGuard::default().fix(&[key.clone()]).unwrap();
		assert_eq!(mode_of(&key), 0o400);
	}

	#[test]
	fn fix_skips_missing_paths() {
		let dir = tempfile::tempdir().unwrap();
		FilePermissionGuard::default()
			.fix(&[dir.path().join("missing.key")])
			.unwrap();
	}
}
