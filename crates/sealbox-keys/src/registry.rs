// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key version registry persisted as a JSON manifest next to the keys.
//!
//! Exactly one version is active once the registry is initialized. Every
//! mutation builds a new manifest, writes it durably and only then swaps it
//! into memory, so readers observe either the previous or the next state.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::RegistryError;
use crate::fsutil::{ensure_private_dir, replace_file};
use crate::rotation::RotationRecord;
use crate::version::KeyVersion;

/// Current manifest format.
pub const REGISTRY_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
	Active,
	Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
	pub version: KeyVersion,
	pub status: VersionStatus,
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
	format: u32,
	entries: Vec<RegistryEntry>,
	#[serde(default)]
	rotations: Vec<RotationRecord>,
}

impl Manifest {
	fn active(&self) -> Option<&RegistryEntry> {
		self.entries
			.iter()
			.find(|e| e.status == VersionStatus::Active)
	}

	fn latest(&self) -> Option<KeyVersion> {
		self.entries.iter().map(|e| e.version).max()
	}

	fn check(&self, path: &Path) -> Result<(), RegistryError> {
		let invalid = |reason: String| RegistryError::Invalid {
			path: path.to_path_buf(),
			reason,
		};

		if self.format != REGISTRY_FORMAT {
			return Err(invalid(format!("unsupported format {}", self.format)));
		}
		let active = self
			.entries
			.iter()
			.filter(|e| e.status == VersionStatus::Active)
			.count();
		if active != 1 {
			return Err(invalid(format!(
				"expected exactly one active version, found {active}"
			)));
		}
		let mut seen = HashSet::new();
		for entry in &self.entries {
			if !seen.insert(entry.version) {
				return Err(invalid(format!("duplicate version {}", entry.version)));
			}
		}
		Ok(())
	}
}

/// Identity of the manifest file as last read or written by this process.
/// A rename-replace changes the inode even when size and mtime collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
	len: u64,
	modified: Option<SystemTime>,
	inode: u64,
}

impl FileStamp {
	fn of(path: &Path) -> Result<Option<Self>, RegistryError> {
		let metadata = match fs::metadata(path) {
			Ok(metadata) => metadata,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
			Err(source) => {
				return Err(RegistryError::Io {
					path: path.to_path_buf(),
					source,
				})
			}
		};
		Ok(Some(Self {
			len: metadata.len(),
			modified: metadata.modified().ok(),
			inode: inode(&metadata),
		}))
	}
}

#[cfg(unix)]
fn inode(metadata: &fs::Metadata) -> u64 {
	use std::os::unix::fs::MetadataExt;
	metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &fs::Metadata) -> u64 {
	0
}

/// Tracks the active DEK version and every retired version still retained.
#[derive(Debug)]
pub struct KeyVersionRegistry {
	path: PathBuf,
	state: RwLock<Option<Manifest>>,
	stamp: Mutex<Option<FileStamp>>,
}

impl KeyVersionRegistry {
	/// Opens the registry at `path`. A missing file yields an uninitialized
	/// registry rather than an error.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
		let path = path.into();
		let stamp = FileStamp::of(&path)?;
		let manifest = read_manifest(&path)?;
		Ok(Self {
			path,
			state: RwLock::new(manifest),
			stamp: Mutex::new(stamp),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn is_initialized(&self) -> bool {
		self.state.read().is_some()
	}

	/// Re-reads the manifest from disk, picking up changes made by other
	/// processes.
	pub fn reload(&self) -> Result<(), RegistryError> {
		let stamp = FileStamp::of(&self.path)?;
		let manifest = read_manifest(&self.path)?;
		*self.state.write() = manifest;
		*self.stamp.lock() = stamp;
		debug!(path = %self.path.display(), "reloaded key registry");
		Ok(())
	}

	/// Reloads only when the manifest on disk differs from the one last seen
	/// here. Costs one `stat` when nothing changed.
	pub fn refresh(&self) -> Result<bool, RegistryError> {
		let current = FileStamp::of(&self.path)?;
		if current == *self.stamp.lock() {
			return Ok(false);
		}
		self.reload()?;
		Ok(true)
	}

	/// Writes the first manifest with `version` active.
	#[instrument(skip_all, fields(version = %version))]
	pub fn create_initial(
		&self,
		version: KeyVersion,
		created_at: DateTime<Utc>,
	) -> Result<(), RegistryError> {
		let mut state = self.state.write();
		if state.is_some() || self.path.exists() {
			return Err(RegistryError::AlreadyInitialized);
		}

		let manifest = Manifest {
			format: REGISTRY_FORMAT,
			entries: vec![RegistryEntry {
				version,
				status: VersionStatus::Active,
				created_at,
				retired_at: None,
			}],
			rotations: Vec::new(),
		};
		self.persist(&manifest)?;
		*state = Some(manifest);
		info!("created key registry");
		Ok(())
	}

	pub fn active_version(&self) -> Result<KeyVersion, RegistryError> {
		self.state
			.read()
			.as_ref()
			.and_then(|m| m.active().map(|e| e.version))
			.ok_or(RegistryError::NotInitialized)
	}

	/// Makes `version` active and retires the previous active version.
	///
	/// `version` must be newer than every version the registry has seen.
	#[instrument(skip_all, fields(version = %version))]
	pub fn register_new_active(&self, version: KeyVersion) -> Result<(), RegistryError> {
		self.update(|manifest| {
			if let Some(latest) = manifest.latest() {
				if version <= latest {
					return Err(RegistryError::NonMonotonic { version, latest });
				}
			}

			let now = Utc::now();
			for entry in &mut manifest.entries {
				if entry.status == VersionStatus::Active {
					entry.status = VersionStatus::Retired;
					entry.retired_at = Some(now);
				}
			}
			manifest.entries.push(RegistryEntry {
				version,
				status: VersionStatus::Active,
				created_at: now,
				retired_at: None,
			});
			Ok(())
		})?;
		info!("registered new active key version");
		Ok(())
	}

	pub fn is_known(&self, version: KeyVersion) -> bool {
		self.state
			.read()
			.as_ref()
			.is_some_and(|m| m.entries.iter().any(|e| e.version == version))
	}

	pub fn retired_versions(&self) -> Vec<KeyVersion> {
		self.versions_where(|e| e.status == VersionStatus::Retired)
	}

	/// Every known version, oldest first.
	pub fn versions(&self) -> Vec<KeyVersion> {
		self.versions_where(|_| true)
	}

	pub fn entries(&self) -> Vec<RegistryEntry> {
		let mut entries = self
			.state
			.read()
			.as_ref()
			.map(|m| m.entries.clone())
			.unwrap_or_default();
		entries.sort_by_key(|e| e.version);
		entries
	}

	pub fn latest_version(&self) -> Option<KeyVersion> {
		self.state.read().as_ref().and_then(Manifest::latest)
	}

	/// The version the next rotation should create.
	pub fn next_version(&self) -> Result<KeyVersion, RegistryError> {
		self.latest_version()
			.map(KeyVersion::next)
			.ok_or(RegistryError::NotInitialized)
	}

	/// Drops a retired version from the registry. Only explicit purges call
	/// this; rotation never does.
	#[instrument(skip_all, fields(version = %version))]
	pub fn forget_retired(&self, version: KeyVersion) -> Result<(), RegistryError> {
		self.update(|manifest| {
			let position = manifest
				.entries
				.iter()
				.position(|e| e.version == version)
				.ok_or(RegistryError::UnknownVersion(version))?;
			if manifest.entries[position].status == VersionStatus::Active {
				return Err(RegistryError::ActiveVersion(version));
			}
			manifest.entries.remove(position);
			Ok(())
		})?;
		info!("removed retired key version from registry");
		Ok(())
	}

	/// Inserts or replaces the rotation record with the same id.
	pub fn upsert_rotation(&self, record: &RotationRecord) -> Result<(), RegistryError> {
		self.update(|manifest| {
			match manifest.rotations.iter_mut().find(|r| r.id == record.id) {
				Some(existing) => *existing = record.clone(),
				None => manifest.rotations.push(record.clone()),
			}
			Ok(())
		})
	}

	pub fn rotations(&self) -> Vec<RotationRecord> {
		self.state
			.read()
			.as_ref()
			.map(|m| m.rotations.clone())
			.unwrap_or_default()
	}

	pub fn latest_rotation(&self) -> Option<RotationRecord> {
		self.state
			.read()
			.as_ref()
			.and_then(|m| m.rotations.iter().max_by_key(|r| r.id).cloned())
	}

	pub fn next_rotation_id(&self) -> u64 {
		self.latest_rotation().map_or(1, |r| r.id + 1)
	}

	fn versions_where(&self, keep: impl Fn(&RegistryEntry) -> bool) -> Vec<KeyVersion> {
		let mut versions: Vec<_> = self
			.state
			.read()
			.as_ref()
			.map(|m| {
				m.entries
					.iter()
					.filter(|e| keep(e))
					.map(|e| e.version)
					.collect()
			})
			.unwrap_or_default();
		versions.sort();
		versions
	}

	fn update(
		&self,
		change: impl FnOnce(&mut Manifest) -> Result<(), RegistryError>,
	) -> Result<(), RegistryError> {
		let mut state = self.state.write();
		let mut next = state.clone().ok_or(RegistryError::NotInitialized)?;
		change(&mut next)?;
		next.check(&self.path)?;
		self.persist(&next)?;
		*state = Some(next);
		Ok(())
	}

	fn persist(&self, manifest: &Manifest) -> Result<(), RegistryError> {
		let io_err = |source: io::Error| RegistryError::Io {
			path: self.path.clone(),
			source,
		};
		let json = serde_json::to_vec_pretty(manifest).map_err(|source| RegistryError::Corrupt {
			path: self.path.clone(),
			source,
		})?;
		if let Some(parent) = self.path.parent() {
			ensure_private_dir(parent).map_err(io_err)?;
		}
		replace_file(&self.path, &json).map_err(io_err)?;
		*self.stamp.lock() = FileStamp::of(&self.path)?;
		Ok(())
	}
}

fn read_manifest(path: &Path) -> Result<Option<Manifest>, RegistryError> {
	let bytes = match fs::read(path) {
		Ok(bytes) => bytes,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
		Err(source) => {
			return Err(RegistryError::Io {
				path: path.to_path_buf(),
				source,
			})
		}
	};

	let manifest: Manifest =
		serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
			path: path.to_path_buf(),
			source,
		})?;
	manifest.check(path)?;
	Ok(Some(manifest))
}
