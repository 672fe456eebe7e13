// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! On-disk key material: the KEK and every DEK version.
//!
//! Each key is a raw 32 byte file with mode 0600. DEK version 1 lives at the
//! configured DEK path and later versions at a version-qualified sibling
//! (`dek.key`, `dek.v2.key`, `dek.v3.key`, ...). Key files are only ever
//! created, never rewritten in place.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sealbox_config::{EncryptionConfig, PermissionsConfig};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::error::{KeyError, ValidationError};
use crate::fsutil::{create_new_file, ensure_private_dir, PRIVATE_FILE_MODE};
use crate::lock::KeyDirLock;
use crate::material::{KeyMaterial, KEY_SIZE};
use crate::permissions::{FilePermissionGuard, PermissionIssue};
use crate::registry::KeyVersionRegistry;
use crate::version::{KeyId, KeyKind, KeyVersion};
use crate::wrap::{unwrap_dek, wrap_dek, WrappedKey};

const INIT_LOCK_FILE: &str = "init.lock";
const ROTATION_LOCK_FILE: &str = "rotation.lock";

/// Resolved locations of every file the store manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
	key_dir: PathBuf,
	kek: PathBuf,
	dek_base: PathBuf,
	registry: PathBuf,
}

impl KeyPaths {
	pub fn from_config(config: &EncryptionConfig) -> Self {
		Self {
			key_dir: config.key_dir.clone(),
			kek: config.kek_path(),
			dek_base: config.dek_path(),
			registry: config.registry_path(),
		}
	}

	pub fn key_dir(&self) -> &Path {
		&self.key_dir
	}

	pub fn kek(&self) -> &Path {
		&self.kek
	}

	pub fn registry(&self) -> &Path {
		&self.registry
	}

	/// Path of a DEK version, derived from the configured DEK path.
	pub fn dek(&self, version: KeyVersion) -> PathBuf {
		if version == KeyVersion::INITIAL {
			return self.dek_base.clone();
		}

		let stem = self
			.dek_base
			.file_stem()
			.map(|s| s.to_string_lossy().into_owned())
			.unwrap_or_else(|| "dek".to_string());
		let name = match self.dek_base.extension() {
			Some(ext) => format!("{stem}.v{version}.{}", ext.to_string_lossy()),
			None => format!("{stem}.v{version}"),
		};
		self.dek_base.with_file_name(name)
	}

	pub fn key(&self, id: KeyId) -> PathBuf {
		match id {
			KeyId::Kek => self.kek.clone(),
			KeyId::Dek(version) => self.dek(version),
		}
	}

	pub fn init_lock(&self) -> PathBuf {
		self.key_dir.join(INIT_LOCK_FILE)
	}

	pub fn rotation_lock(&self) -> PathBuf {
		self.key_dir.join(ROTATION_LOCK_FILE)
	}
}

/// What [`KeyMaterialStore::initialize`] had to create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct InitReport {
	pub created_kek: bool,
	pub created_dek: bool,
	pub created_registry: bool,
}

impl InitReport {
	pub fn created_anything(&self) -> bool {
		self.created_kek || self.created_dek || self.created_registry
	}
}

/// Loads, generates and persists key files, caching loaded keys in memory.
#[derive(Debug)]
pub struct KeyMaterialStore {
	paths: KeyPaths,
	guard: FilePermissionGuard,
	strict_permissions: bool,
	cache: RwLock<HashMap<KeyId, Arc<KeyMaterial>>>,
}

impl KeyMaterialStore {
	pub fn new(paths: KeyPaths, guard: FilePermissionGuard, strict_permissions: bool) -> Self {
		Self {
			paths,
			guard,
			strict_permissions,
			cache: RwLock::new(HashMap::new()),
		}
	}

	pub fn from_config(encryption: &EncryptionConfig, permissions: &PermissionsConfig) -> Self {
		Self::new(
			KeyPaths::from_config(encryption),
			FilePermissionGuard::new(permissions.owner_uid),
			encryption.strict_permissions,
		)
	}

	pub fn paths(&self) -> &KeyPaths {
		&self.paths
	}

	pub fn guard(&self) -> &FilePermissionGuard {
		&self.guard
	}

	/// Creates the KEK, DEK version 1 and the registry if they are missing.
	///
	/// Safe to run repeatedly and from several processes at once. When the
	/// registry already exists, nothing is generated: a missing key file is
	/// reported as [`KeyError::KeyNotFound`] because replacing it would make
	/// existing ciphertexts unreadable.
	#[instrument(skip_all, fields(key_dir = %self.paths.key_dir.display()))]
	pub fn initialize(&self, registry: &KeyVersionRegistry) -> Result<InitReport, KeyError> {
		ensure_private_dir(&self.paths.key_dir)
			.map_err(|e| KeyError::io(&self.paths.key_dir, e))?;
		let lock_path = self.paths.init_lock();
		let _lock = KeyDirLock::acquire(&lock_path).map_err(|e| KeyError::io(&lock_path, e))?;

		registry.reload()?;
		if registry.is_initialized() {
			self.load_key(KeyId::Kek)?;
			for version in registry.versions() {
				self.load_key(KeyId::Dek(version))?;
			}
			debug!("key store already initialized");
			return Ok(InitReport::default());
		}

		let created_kek = self.ensure_key(KeyId::Kek)?;
		let created_dek = self.ensure_key(KeyId::Dek(KeyVersion::INITIAL))?;
		if !created_dek {
			info!(path = %self.paths.dek_base.display(), "adopting existing DEK as version 1");
		}
		registry.create_initial(KeyVersion::INITIAL, Utc::now())?;

		let report = InitReport {
			created_kek,
			created_dek,
			created_registry: true,
		};
		info!(
			created_kek = report.created_kek,
			created_dek = report.created_dek,
			"initialized key store"
		);
		Ok(report)
	}

	/// Generates the key if its file is missing, otherwise validates it.
	fn ensure_key(&self, id: KeyId) -> Result<bool, KeyError> {
		let path = self.paths.key(id);
		if path.exists() {
			self.load_key(id)?;
			return Ok(false);
		}

		let material = KeyMaterial::generate(id.kind(), id.version());
		match create_new_file(&path, material.expose()) {
			Ok(()) => {
				info!(key = %id, path = %path.display(), "generated key");
				Ok(true)
			}
			Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
				debug!(key = %id, "key created concurrently");
				self.load_key(id)?;
				Ok(false)
			}
			Err(e) => Err(KeyError::io(path, e)),
		}
	}

	/// Resolves a key, from the cache when it has been loaded before.
	pub fn load_key(&self, id: KeyId) -> Result<Arc<KeyMaterial>, KeyError> {
		if let Some(material) = self.cache.read().get(&id) {
			return Ok(Arc::clone(material));
		}

		let material = Arc::new(self.read_key_file(id)?);
		let mut cache = self.cache.write();
		Ok(Arc::clone(cache.entry(id).or_insert(material)))
	}

	fn read_key_file(&self, id: KeyId) -> Result<KeyMaterial, KeyError> {
		let path = self.paths.key(id);
		let mut file = match File::open(&path) {
			Ok(file) => file,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(KeyError::KeyNotFound {
					kind: id.kind(),
					version: id.version(),
					path,
				})
			}
			Err(e) => return Err(KeyError::io(path, e)),
		};

		let metadata = file.metadata().map_err(|e| KeyError::io(&path, e))?;
		if metadata.len() != KEY_SIZE as u64 {
			return Err(KeyError::InvalidKeySize {
				expected: KEY_SIZE,
				actual: metadata.len(),
				path: Some(path),
			});
		}
		if self.strict_permissions {
			check_mode(&path, &metadata)?;
		}

		let mut bytes = Zeroizing::new(Vec::with_capacity(KEY_SIZE + 1));
		(&mut file)
			.take(KEY_SIZE as u64 + 1)
			.read_to_end(&mut bytes)
			.map_err(|e| KeyError::io(&path, e))?;

		let created_at = metadata
			.modified()
			.map(DateTime::<Utc>::from)
			.unwrap_or_else(|_| Utc::now());
		let material = KeyMaterial::from_slice(id.kind(), id.version(), &bytes, created_at)
			.map_err(|err| match err {
				KeyError::InvalidKeySize {
					expected, actual, ..
				} => KeyError::InvalidKeySize {
					expected,
					actual,
					path: Some(path.clone()),
				},
				other => other,
			})?;
		debug!(key = %id, "loaded key");
		Ok(material)
	}

	/// Writes a new DEK version. Never overwrites an existing version file.
	#[instrument(skip_all, fields(version = %material.version()))]
	pub fn persist_new_dek(&self, material: &KeyMaterial) -> Result<(), KeyError> {
		if material.kind() != KeyKind::Dek {
			return Err(KeyError::WrongKind {
				expected: KeyKind::Dek,
				actual: material.kind(),
			});
		}

		let path = self.paths.dek(material.version());
		if let Some(parent) = path.parent() {
			ensure_private_dir(parent).map_err(|e| KeyError::io(parent, e))?;
		}
		create_new_file(&path, material.expose()).map_err(|e| {
			if e.kind() == io::ErrorKind::AlreadyExists {
				KeyError::AlreadyExists { path: path.clone() }
			} else {
				KeyError::io(&path, e)
			}
		})?;
		info!(path = %path.display(), "persisted new DEK version");
		Ok(())
	}

	/// Checks existence, size, mode and ownership of the KEK and every DEK
	/// version the registry references, collecting every problem found.
	#[instrument(skip_all)]
	pub fn validate_all(&self, registry: &KeyVersionRegistry) -> Result<(), ValidationError> {
		let mut problems = Vec::new();

		let dir = self.guard.inspect(&self.paths.key_dir);
		problems.extend(permission_problems(&dir.path, &dir.issues));

		if !registry.is_initialized() {
			problems.push(KeyError::NotInitialized);
		}

		let ids = std::iter::once(KeyId::Kek).chain(registry.versions().into_iter().map(KeyId::Dek));
		for id in ids {
			let path = self.paths.key(id);
			let metadata = match fs::metadata(&path) {
				Ok(metadata) => metadata,
				Err(e) if e.kind() == io::ErrorKind::NotFound => {
					problems.push(KeyError::KeyNotFound {
						kind: id.kind(),
						version: id.version(),
						path,
					});
					continue;
				}
				Err(e) => {
					problems.push(KeyError::io(path, e));
					continue;
				}
			};

			if metadata.len() != KEY_SIZE as u64 {
				problems.push(KeyError::InvalidKeySize {
					expected: KEY_SIZE,
					actual: metadata.len(),
					path: Some(path.clone()),
				});
			}
			let finding = self.guard.inspect(&path);
			problems.extend(permission_problems(&path, &finding.issues));
		}

		if problems.is_empty() {
			debug!("all key files valid");
			Ok(())
		} else {
			warn!(problems = problems.len(), "key validation found problems");
			Err(ValidationError { problems })
		}
	}

	/// Drops every cached key so the next load reads from disk.
	pub fn invalidate_cache(&self) {
		self.cache.write().clear();
		debug!("key cache invalidated");
	}

	/// A DEK version wrapped under the KEK, for backup.
	#[instrument(skip_all, fields(version = %version))]
	pub fn export_wrapped_dek(&self, version: KeyVersion) -> Result<WrappedKey, KeyError> {
		let kek = self.load_key(KeyId::Kek)?;
		let dek = self.load_key(KeyId::Dek(version))?;
		let wrapped = wrap_dek(&kek, &dek)?;
		info!("exported wrapped DEK");
		Ok(wrapped)
	}

	/// Restores a wrapped DEK version the registry knows but whose file is
	/// missing on this host. Restoring identical bytes again is a no-op.
	#[instrument(skip_all, fields(version = %wrapped.version))]
	pub fn import_wrapped_dek(
		&self,
		wrapped: &WrappedKey,
		registry: &KeyVersionRegistry,
	) -> Result<(), KeyError> {
		if !registry.is_known(wrapped.version) {
			return Err(KeyError::RestoreRejected {
				version: wrapped.version,
				reason: "version is not in the key registry".to_string(),
			});
		}

		let kek = self.load_key(KeyId::Kek)?;
		let dek = unwrap_dek(&kek, wrapped)?;

		if self.paths.dek(wrapped.version).exists() {
			let existing = self.load_key(KeyId::Dek(wrapped.version))?;
			if existing.expose() == dek.expose() {
				debug!("DEK version already present");
				return Ok(());
			}
			return Err(KeyError::RestoreRejected {
				version: wrapped.version,
				reason: "a different key is already stored for this version".to_string(),
			});
		}

		self.persist_new_dek(&dek)?;
		info!("restored DEK from backup");
		Ok(())
	}

	/// Deletes a DEK version file. Only explicit purges call this.
	pub fn remove_dek(&self, version: KeyVersion) -> Result<(), KeyError> {
		let path = self.paths.dek(version);
		match fs::remove_file(&path) {
			Ok(()) => info!(version = %version, path = %path.display(), "removed DEK file"),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => return Err(KeyError::io(path, e)),
		}
		self.cache.write().remove(&KeyId::Dek(version));
		Ok(())
	}

	/// The next version the registry would assign, skipping any version whose
	/// file already exists (left behind by a rotation that failed before it
	/// could register).
	pub fn next_unused_version(&self, registry: &KeyVersionRegistry) -> Result<KeyVersion, KeyError> {
		let mut version = registry.next_version()?;
		while self.paths.dek(version).exists() {
			warn!(
				version = %version,
				path = %self.paths.dek(version).display(),
				"skipping orphaned DEK file"
			);
			version = version.next();
		}
		Ok(version)
	}

	/// Key directory, KEK, every registered DEK version and the registry.
	pub fn protected_paths(&self, registry: &KeyVersionRegistry) -> Vec<PathBuf> {
		let mut paths = vec![self.paths.key_dir.clone(), self.paths.kek.clone()];
		paths.extend(registry.versions().into_iter().map(|v| self.paths.dek(v)));
		paths.push(self.paths.registry.clone());
		paths
	}
}

fn permission_problems(path: &Path, issues: &[PermissionIssue]) -> Vec<KeyError> {
	issues
		.iter()
		.filter_map(|issue| match *issue {
			PermissionIssue::ModeTooPermissive { actual, expected } => {
				Some(KeyError::PermissionViolation {
					path: path.to_path_buf(),
					actual,
					expected,
				})
			}
			PermissionIssue::OwnerMismatch { actual, expected } => {
				Some(KeyError::OwnershipMismatch {
					path: path.to_path_buf(),
					actual,
					expected,
				})
			}
			PermissionIssue::Inaccessible { os_error } => Some(KeyError::io(
				path,
				os_error.map_or_else(
					|| io::Error::new(io::ErrorKind::Other, "metadata unavailable"),
					io::Error::from_raw_os_error,
				),
			)),
			PermissionIssue::Missing | PermissionIssue::NotRegularFile => None,
		})
		.collect()
}

#[cfg(unix)]
fn check_mode(path: &Path, metadata: &fs::Metadata) -> Result<(), KeyError> {
	use std::os::unix::fs::PermissionsExt;

	let mode = metadata.permissions().mode() & 0o7777;
	if mode & !PRIVATE_FILE_MODE != 0 {
		return Err(KeyError::PermissionViolation {
			path: path.to_path_buf(),
			actual: mode,
			expected: PRIVATE_FILE_MODE,
		});
	}
	Ok(())
}

#[cfg(not(unix))]
fn check_mode(_path: &Path, _metadata: &fs::Metadata) -> Result<(), KeyError> {
	Ok(())
}
