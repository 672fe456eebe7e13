// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The caller-facing entry point.
//!
//! [`KeyService`] is constructed explicitly from configuration and passed to
//! whatever needs it; there is no process-wide instance.

use std::path::PathBuf;
use std::sync::Arc;

use sealbox_config::SealboxConfig;
use serde::Serialize;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use crate::cipher::EnvelopeCipher;
use crate::envelope::{Envelope, RecordKind};
use crate::error::{
	CryptoError, KeyError, MigrationError, PermissionError, RotationError, ValidationError,
};
use crate::lookup::LookupHasher;
use crate::migrate::{EnvelopeStorage, MigrationReport, StorageMigrator};
use crate::permissions::PermissionReport;
use crate::registry::KeyVersionRegistry;
use crate::rotation::{MigrationRequest, RotationCoordinator, RotationRecord};
use crate::store::{InitReport, KeyMaterialStore};
use crate::version::{KeyId, KeyVersion};
use crate::wrap::WrappedKey;

/// Snapshot returned by [`KeyService::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
	pub enabled: bool,
	pub initialized: bool,
	pub active_key_version: Option<KeyVersion>,
}

/// Envelope encryption and key lifecycle for one key directory.
#[derive(Debug)]
pub struct KeyService {
	config: SealboxConfig,
	store: Arc<KeyMaterialStore>,
	registry: Arc<KeyVersionRegistry>,
	cipher: EnvelopeCipher,
	coordinator: RotationCoordinator,
}

impl KeyService {
	/// Opens the key directory described by `config`. Nothing is created
	/// until [`initialize`](Self::initialize).
	pub fn open(config: &SealboxConfig) -> Result<Self, KeyError> {
		let store = Arc::new(KeyMaterialStore::from_config(
			&config.encryption,
			&config.permissions,
		));
		let registry = Arc::new(KeyVersionRegistry::open(config.encryption.registry_path())?);
		let cipher = EnvelopeCipher::new(Arc::clone(&store), Arc::clone(&registry));
		let coordinator = RotationCoordinator::new(cipher.clone());

		debug!(
			enabled = config.encryption.enabled,
			key_dir = %config.encryption.key_dir.display(),
			initialized = registry.is_initialized(),
			"opened key service"
		);
		Ok(Self {
			config: config.clone(),
			store,
			registry,
			cipher,
			coordinator,
		})
	}

	pub fn config(&self) -> &SealboxConfig {
		&self.config
	}

	pub fn is_enabled(&self) -> bool {
		self.config.encryption.enabled
	}

	pub fn store(&self) -> &KeyMaterialStore {
		&self.store
	}

	pub fn registry(&self) -> &KeyVersionRegistry {
		&self.registry
	}

	pub fn cipher(&self) -> &EnvelopeCipher {
		&self.cipher
	}

	pub fn coordinator(&self) -> &RotationCoordinator {
		&self.coordinator
	}

	#[instrument(skip_all)]
	pub fn initialize(&self) -> Result<InitReport, KeyError> {
		self.ensure_enabled()?;
		self.store.initialize(&self.registry)
	}

	/// Reports state as seen on disk now, including rotations by other
	/// processes.
	pub fn status(&self) -> KeyStatus {
		if let Err(e) = self.registry.reload() {
			warn!(error = %e, "could not reload key registry");
		}
		KeyStatus {
			enabled: self.is_enabled(),
			initialized: self.registry.is_initialized(),
			active_key_version: self.registry.active_version().ok(),
		}
	}

	pub fn encrypt(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Envelope, CryptoError> {
		if !self.is_enabled() {
			return Err(CryptoError::Disabled);
		}
		self.cipher.encrypt(plaintext, aad)
	}

	/// Encrypts with the record kind as associated data.
	pub fn encrypt_record(&self, kind: &RecordKind, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
		self.encrypt(plaintext, Some(kind.aad()))
	}

	pub fn decrypt(&self, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
		if !self.is_enabled() {
			return Err(CryptoError::Disabled);
		}
		self.cipher.decrypt(envelope)
	}

	/// Decrypts an envelope that must have been produced for `kind`.
	pub fn decrypt_record(
		&self,
		kind: &RecordKind,
		envelope: &Envelope,
	) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
		if !self.is_enabled() {
			return Err(CryptoError::Disabled);
		}
		if envelope.aad.as_deref() != Some(kind.aad()) {
			return Err(CryptoError::DecryptionFailed);
		}
		self.cipher.decrypt(envelope)
	}

	pub fn rotate<F>(&self, migrate: F) -> Result<RotationRecord, RotationError>
	where
		F: FnOnce(&MigrationRequest<'_>) -> Result<MigrationReport, MigrationError>,
	{
		if !self.is_enabled() {
			return Err(RotationError::Disabled);
		}
		self.coordinator.rotate(migrate)
	}

	/// Activates a new DEK and leaves stored envelopes for a later
	/// [`resume_rotation_with_storage`](Self::resume_rotation_with_storage).
	pub fn rotate_key_only(&self) -> Result<RotationRecord, RotationError> {
		if !self.is_enabled() {
			return Err(RotationError::Disabled);
		}
		self.coordinator.rotate_key_only()
	}

	/// The latest rotation whose envelopes still need migrating, if any.
	pub fn pending_rotation(&self) -> Result<Option<RotationRecord>, KeyError> {
		self.ensure_enabled()?;
		self.registry.reload()?;
		Ok(self
			.registry
			.latest_rotation()
			.filter(RotationRecord::is_resumable))
	}

	/// Rotates and migrates through `storage` with the configured batching.
	pub fn rotate_with_storage<S>(&self, storage: &S) -> Result<RotationRecord, RotationError>
	where
		S: EnvelopeStorage + ?Sized,
	{
		let migrator = StorageMigrator::new(storage, &self.config.rotation);
		self.rotate(|request| migrator.run(request))
	}

	pub fn resume_rotation<F>(&self, migrate: F) -> Result<RotationRecord, RotationError>
	where
		F: FnOnce(&MigrationRequest<'_>) -> Result<MigrationReport, MigrationError>,
	{
		if !self.is_enabled() {
			return Err(RotationError::Disabled);
		}
		self.coordinator.resume(migrate)
	}

	pub fn resume_rotation_with_storage<S>(
		&self,
		storage: &S,
	) -> Result<RotationRecord, RotationError>
	where
		S: EnvelopeStorage + ?Sized,
	{
		let migrator = StorageMigrator::new(storage, &self.config.rotation);
		self.resume_rotation(|request| migrator.run(request))
	}

	pub fn purge_retired<S>(&self, version: KeyVersion, storage: &S) -> Result<(), RotationError>
	where
		S: EnvelopeStorage + ?Sized,
	{
		if !self.is_enabled() {
			return Err(RotationError::Disabled);
		}
		self.coordinator.purge_retired(version, storage)
	}

	/// Key directory, key files, registry and any configured extra paths.
	/// Works with encryption disabled.
	pub fn protected_paths(&self) -> Vec<PathBuf> {
		let mut paths = self.store.protected_paths(&self.registry);
		paths.extend(self.config.permissions.extra_paths.iter().cloned());
		paths
	}

	pub fn audit_permissions(&self) -> PermissionReport {
		self.store.guard().audit(&self.protected_paths())
	}

	pub fn fix_permissions(&self) -> Result<(), PermissionError> {
		self.store.guard().fix(&self.protected_paths())
	}

	pub fn validate(&self) -> Result<(), ValidationError> {
		if !self.is_enabled() {
			return Err(ValidationError {
				problems: vec![KeyError::Disabled],
			});
		}
		if let Err(e) = self.registry.reload() {
			return Err(ValidationError {
				problems: vec![e.into()],
			});
		}
		self.store.validate_all(&self.registry)
	}

	/// Deterministic hash of a token for indexed lookup.
	pub fn lookup_hash(&self, kind: &RecordKind, token: &[u8]) -> Result<String, KeyError> {
		Ok(self.lookup_hasher()?.hash(kind, token))
	}

	pub fn lookup_matches(
		&self,
		kind: &RecordKind,
		token: &[u8],
		stored: &str,
	) -> Result<bool, KeyError> {
		Ok(self.lookup_hasher()?.matches(kind, token, stored))
	}

	fn lookup_hasher(&self) -> Result<LookupHasher, KeyError> {
		self.ensure_enabled()?;
		let kek = self.store.load_key(KeyId::Kek)?;
		LookupHasher::from_kek(&kek)
	}

	pub fn export_key(&self, version: KeyVersion) -> Result<WrappedKey, KeyError> {
		self.ensure_enabled()?;
		self.registry.reload()?;
		if !self.registry.is_known(version) {
			return Err(KeyError::KeyNotFound {
				kind: crate::version::KeyKind::Dek,
				version,
				path: self.store.paths().dek(version),
			});
		}
		self.store.export_wrapped_dek(version)
	}

	pub fn import_key(&self, wrapped: &WrappedKey) -> Result<(), KeyError> {
		self.ensure_enabled()?;
		self.registry.reload()?;
		self.store.import_wrapped_dek(wrapped, &self.registry)
	}

	fn ensure_enabled(&self) -> Result<(), KeyError> {
		if self.is_enabled() {
			Ok(())
		} else {
			Err(KeyError::Disabled)
		}
	}
}
