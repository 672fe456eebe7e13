// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! DEK rotation.
//!
//! ```text
//! Idle -> GeneratingKey -> Registering -> Migrating -> Completed
//!              \________________\______________\______> Failed
//! ```
//!
//! A failed or interrupted rotation never removes the previous version, so
//! every envelope stays decryptable and the migration step can be resumed.
//! Migration covers every retained version older than the target, so a
//! later rotation also picks up records an unfinished one left behind.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::cipher::EnvelopeCipher;
use crate::envelope::Envelope;
use crate::error::{CryptoError, MigrationError, RegistryError, RotationError};
use crate::lock::KeyDirLock;
use crate::material::KeyMaterial;
use crate::migrate::{EnvelopeStorage, MigrationReport};
use crate::version::{KeyKind, KeyVersion};

/// Persisted status of a rotation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStatus {
	Pending,
	Migrating,
	Completed,
	Failed,
}

/// In-process phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
	Idle,
	GeneratingKey,
	Registering,
	Migrating,
	Completed,
	Failed,
}

/// Record counts accumulated across every migration attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
	pub migrated: u64,
	pub skipped: u64,
	/// Records that failed in the most recent attempt.
	pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRecord {
	pub id: u64,
	pub from_version: KeyVersion,
	pub to_version: KeyVersion,
	pub status: RotationStatus,
	pub started_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub progress: MigrationProgress,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
	/// Number of times the migration step has run.
	#[serde(default)]
	pub attempts: u32,
}

impl RotationRecord {
	fn new(id: u64, from_version: KeyVersion, to_version: KeyVersion) -> Self {
		Self {
			id,
			from_version,
			to_version,
			status: RotationStatus::Pending,
			started_at: Utc::now(),
			completed_at: None,
			progress: MigrationProgress::default(),
			last_error: None,
			attempts: 0,
		}
	}

	pub fn is_resumable(&self) -> bool {
		matches!(
			self.status,
			RotationStatus::Migrating | RotationStatus::Failed
		)
	}
}

/// One record that could not be migrated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
	pub record_id: String,
	pub reason: String,
}

/// Handed to the migration callback: which versions to move between and the
/// means to re-encrypt.
///
/// `source_versions` lists every retained version older than `to_version`, so
/// envelopes left behind by an earlier failed or key-only rotation are moved
/// along with those on `from_version`.
#[derive(Debug, Clone)]
pub struct MigrationRequest<'a> {
	pub rotation_id: u64,
	pub from_version: KeyVersion,
	pub to_version: KeyVersion,
	source_versions: Vec<KeyVersion>,
	cipher: &'a EnvelopeCipher,
}

impl<'a> MigrationRequest<'a> {
	pub fn new(
		rotation_id: u64,
		from_version: KeyVersion,
		to_version: KeyVersion,
		cipher: &'a EnvelopeCipher,
	) -> Self {
		Self {
			rotation_id,
			from_version,
			to_version,
			source_versions: vec![from_version],
			cipher,
		}
	}

	/// Replaces the versions to migrate away from. Versions not older than
	/// `to_version` are dropped; `from_version` is always kept.
	#[must_use]
	pub fn with_source_versions(mut self, versions: impl IntoIterator<Item = KeyVersion>) -> Self {
		let mut sources: Vec<_> = versions
			.into_iter()
			.chain(std::iter::once(self.from_version))
			.filter(|v| *v < self.to_version)
			.collect();
		sources.sort_unstable();
		sources.dedup();
		self.source_versions = sources;
		self
	}

	/// Oldest first.
	pub fn source_versions(&self) -> &[KeyVersion] {
		&self.source_versions
	}

	/// Re-encrypts onto `to_version`; `None` if the envelope is already there.
	pub fn reencrypt(&self, envelope: &Envelope) -> Result<Option<Envelope>, CryptoError> {
		self.cipher.reencrypt(envelope, self.to_version)
	}

	pub fn cipher(&self) -> &'a EnvelopeCipher {
		self.cipher
	}
}

/// Drives rotation, resume and purge. Mutations are serialized across
/// processes by a non-blocking lock next to the keys.
#[derive(Debug)]
pub struct RotationCoordinator {
	cipher: EnvelopeCipher,
	phase: Mutex<RotationPhase>,
}

impl RotationCoordinator {
	pub fn new(cipher: EnvelopeCipher) -> Self {
		Self {
			cipher,
			phase: Mutex::new(RotationPhase::Idle),
		}
	}

	pub fn phase(&self) -> RotationPhase {
		*self.phase.lock()
	}

	fn set_phase(&self, phase: RotationPhase) {
		*self.phase.lock() = phase;
	}

	/// Generates a new DEK, makes it active and migrates existing envelopes
	/// through `migrate`.
	///
	/// Fails fast with [`RotationError::InProgress`] if another rotation holds
	/// the lock. When `migrate` reports failures, the returned
	/// [`RotationError::Failed`] carries the persisted record.
	#[instrument(skip_all)]
	pub fn rotate<F>(&self, migrate: F) -> Result<RotationRecord, RotationError>
	where
		F: FnOnce(&MigrationRequest<'_>) -> Result<MigrationReport, MigrationError>,
	{
		let _lock = self.lock()?;
		let record = self.begin()?;
		self.run_migration(record, migrate)
	}

	/// Generates and activates a new DEK without touching stored envelopes.
	///
	/// The record is left `Migrating` so that whoever owns the storage can
	/// finish the job with [`resume`](Self::resume). New envelopes use the new
	/// version immediately; existing ones keep decrypting under the old one.
	#[instrument(skip_all)]
	pub fn rotate_key_only(&self) -> Result<RotationRecord, RotationError> {
		let _lock = self.lock()?;
		let record = self.begin()?;
		self.set_phase(RotationPhase::Migrating);
		info!(
			rotation = record.id,
			to = %record.to_version,
			"new key version active; stored envelopes await migration"
		);
		Ok(record)
	}

	/// Persists a `Pending` record, then generates, persists and registers the
	/// next DEK and marks the record `Migrating`. Caller holds the lock.
	fn begin(&self) -> Result<RotationRecord, RotationError> {
		let store = self.cipher.store();
		let registry = self.cipher.registry();

		registry.reload()?;
		let from = registry.active_version()?;
		let to = store.next_unused_version(registry)?;
		let mut record = RotationRecord::new(registry.next_rotation_id(), from, to);
		registry.upsert_rotation(&record)?;
		info!(rotation = record.id, from = %from, to = %to, "starting key rotation");

		self.set_phase(RotationPhase::GeneratingKey);
		let material = KeyMaterial::generate(KeyKind::Dek, to);
		if let Err(e) = store.persist_new_dek(&material) {
			self.abandon(&mut record, &e.to_string());
			return Err(e.into());
		}
		drop(material);

		self.set_phase(RotationPhase::Registering);
		if let Err(e) = registry.register_new_active(to) {
			self.abandon(&mut record, &e.to_string());
			return Err(e.into());
		}
		store.invalidate_cache();

		record.status = RotationStatus::Migrating;
		registry.upsert_rotation(&record)?;
		Ok(record)
	}

	/// Re-runs the migration step of the latest failed or interrupted
	/// rotation. Records already on the target version are skipped.
	#[instrument(skip_all)]
	pub fn resume<F>(&self, migrate: F) -> Result<RotationRecord, RotationError>
	where
		F: FnOnce(&MigrationRequest<'_>) -> Result<MigrationReport, MigrationError>,
	{
		let _lock = self.lock()?;
		let registry = self.cipher.registry();

		registry.reload()?;
		let mut record = registry
			.latest_rotation()
			.filter(RotationRecord::is_resumable)
			.ok_or(RotationError::NothingToResume)?;
		let active = registry.active_version()?;
		if record.to_version != active {
			return Err(RotationError::StaleRotation {
				to_version: record.to_version,
				active,
			});
		}

		info!(
			rotation = record.id,
			from = %record.from_version,
			to = %record.to_version,
			attempt = record.attempts + 1,
			"resuming key rotation"
		);
		record.status = RotationStatus::Migrating;
		record.last_error = None;
		registry.upsert_rotation(&record)?;
		self.run_migration(record, migrate)
	}

	/// Deletes a retired DEK version that no stored envelope references.
	///
	/// Never called by rotation itself.
	#[instrument(skip_all, fields(version = %version))]
	pub fn purge_retired<S>(&self, version: KeyVersion, storage: &S) -> Result<(), RotationError>
	where
		S: EnvelopeStorage + ?Sized,
	{
		let _lock = self.lock()?;
		let registry = self.cipher.registry();

		registry.reload()?;
		let active = registry.active_version()?;
		if version == active {
			return Err(RegistryError::ActiveVersion(version).into());
		}
		if !registry.is_known(version) {
			return Err(RegistryError::UnknownVersion(version).into());
		}

		if let Some(first) = storage.enumerate_envelopes_by_key_version(version)?.next() {
			first?;
			warn!("refusing to purge a key version still in use");
			return Err(RotationError::VersionInUse { version });
		}

		registry.forget_retired(version)?;
		self.cipher.store().remove_dek(version)?;
		info!("purged retired key version");
		Ok(())
	}

	fn run_migration<F>(
		&self,
		mut record: RotationRecord,
		migrate: F,
	) -> Result<RotationRecord, RotationError>
	where
		F: FnOnce(&MigrationRequest<'_>) -> Result<MigrationReport, MigrationError>,
	{
		self.set_phase(RotationPhase::Migrating);
		record.attempts += 1;
		let request = MigrationRequest::new(
			record.id,
			record.from_version,
			record.to_version,
			&self.cipher,
		)
		.with_source_versions(self.cipher.registry().retired_versions());

		let failures = match migrate(&request) {
			Ok(report) => {
				absorb(&mut record, &report);
				if !report.is_complete() {
					record.last_error = Some(format!(
						"{} record(s) failed to migrate",
						report.failures.len()
					));
				}
				report.failures
			}
			Err(MigrationError::Interrupted { source, partial }) => {
				absorb(&mut record, &partial);
				record.last_error = Some(source.to_string());
				partial.failures
			}
			Err(MigrationError::Aborted(reason)) => {
				record.last_error = Some(reason);
				Vec::new()
			}
		};

		if record.last_error.is_none() {
			record.status = RotationStatus::Completed;
			record.completed_at = Some(Utc::now());
			self.cipher.registry().upsert_rotation(&record)?;
			self.settle_superseded(&record)?;
			self.set_phase(RotationPhase::Completed);
			info!(
				rotation = record.id,
				migrated = record.progress.migrated,
				skipped = record.progress.skipped,
				"key rotation completed"
			);
			return Ok(record);
		}

		record.status = RotationStatus::Failed;
		self.cipher.registry().upsert_rotation(&record)?;
		self.set_phase(RotationPhase::Failed);
		error!(
			rotation = record.id,
			failed = record.progress.failed,
			error = record.last_error.as_deref().unwrap_or_default(),
			"key rotation failed; previous key version remains available"
		);
		Err(RotationError::Failed {
			record: Box::new(record),
			failures,
		})
	}

	/// Completes earlier unfinished rotations. `record` migrated every older
	/// version, so nothing they were waiting on is left.
	fn settle_superseded(&self, record: &RotationRecord) -> Result<(), RotationError> {
		let registry = self.cipher.registry();
		for mut earlier in registry.rotations() {
			if earlier.id >= record.id || !earlier.is_resumable() {
				continue;
			}
			earlier.status = RotationStatus::Completed;
			earlier.completed_at = record.completed_at;
			earlier.last_error = None;
			earlier.progress.failed = 0;
			registry.upsert_rotation(&earlier)?;
			info!(
				rotation = earlier.id,
				superseded_by = record.id,
				"earlier rotation completed by a later migration"
			);
		}
		Ok(())
	}

	/// Marks a rotation that failed before migration began.
	fn abandon(&self, record: &mut RotationRecord, reason: &str) {
		self.set_phase(RotationPhase::Failed);
		record.status = RotationStatus::Failed;
		record.last_error = Some(reason.to_string());
		if let Err(e) = self.cipher.registry().upsert_rotation(record) {
			warn!(rotation = record.id, error = %e, "failed to record rotation failure");
		}
		error!(rotation = record.id, error = reason, "key rotation failed");
	}

	fn lock(&self) -> Result<KeyDirLock, RotationError> {
		let path = self.cipher.store().paths().rotation_lock();
		match KeyDirLock::try_acquire(&path) {
			Ok(Some(lock)) => Ok(lock),
			Ok(None) => {
				warn!("rotation lock is held by another operation");
				Err(RotationError::InProgress)
			}
			Err(source) => Err(RotationError::Lock { path, source }),
		}
	}
}

fn absorb(record: &mut RotationRecord, report: &MigrationReport) {
	record.progress.migrated += report.migrated;
	record.progress.skipped += report.skipped;
	record.progress.failed = report.failures.len() as u64;
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	use sealbox_config::{EncryptionConfig, PermissionsConfig};

	use crate::error::{ErrorKind, StorageError};
	use crate::registry::KeyVersionRegistry;
	use crate::store::KeyMaterialStore;

	fn coordinator() -> (tempfile::TempDir, RotationCoordinator) {
		let dir = tempfile::tempdir().unwrap();
		let config = EncryptionConfig::with_key_dir(dir.path());
		let store = Arc::new(KeyMaterialStore::from_config(
			&config,
			&PermissionsConfig::default(),
		));
		let registry = Arc::new(KeyVersionRegistry::open(config.registry_path()).unwrap());
		store.initialize(&registry).unwrap();
		(dir, RotationCoordinator::new(EnvelopeCipher::new(store, registry)))
	}

	fn v(n: u64) -> KeyVersion {
		KeyVersion::new(n).unwrap()
	}

	fn nothing_to_migrate(_: &MigrationRequest<'_>) -> Result<MigrationReport, MigrationError> {
		Ok(MigrationReport::default())
	}

	#[test]
	fn rotate_registers_next_version() {
		let (_dir, coordinator) = coordinator();
		assert_eq!(coordinator.phase(), RotationPhase::Idle);

		let record = coordinator.rotate(nothing_to_migrate).unwrap();

		assert_eq!(record.from_version, v(1));
		assert_eq!(record.to_version, v(2));
		assert_eq!(record.status, RotationStatus::Completed);
		assert!(record.completed_at.is_some());
		assert_eq!(coordinator.phase(), RotationPhase::Completed);
		assert_eq!(coordinator.cipher.registry().active_version().unwrap(), v(2));
		assert_eq!(coordinator.cipher.registry().retired_versions(), vec![v(1)]);
	}

	#[test]
	fn callback_sees_from_and_to() {
		let (_dir, coordinator) = coordinator();
		coordinator.rotate(nothing_to_migrate).unwrap();

		let record = coordinator
			.rotate(|request| {
				assert_eq!(request.from_version, v(2));
				assert_eq!(request.to_version, v(3));
				Ok(MigrationReport {
					migrated: 5,
					..Default::default()
				})
			})
			.unwrap();
		assert_eq!(record.progress.migrated, 5);
		assert_eq!(record.id, 2);
	}

	#[test]
	fn partial_failure_keeps_old_version_and_resumes() {
		let (_dir, coordinator) = coordinator();
		let err = coordinator
			.rotate(|_| {
				Ok(MigrationReport {
					migrated: 3,
					skipped: 0,
					failures: vec![RecordFailure {
						record_id: "rec-9".into(),
						reason: "database is locked".into(),
					}],
				})
			})
			.unwrap_err();

		assert_eq!(err.kind(), ErrorKind::RotationFailed);
		let record = err.record().unwrap();
		assert_eq!(record.status, RotationStatus::Failed);
		assert_eq!(record.progress.migrated, 3);
		assert_eq!(record.progress.failed, 1);
		assert_eq!(coordinator.phase(), RotationPhase::Failed);
		assert!(coordinator.cipher.registry().is_known(v(1)));
		assert!(coordinator.cipher.store().paths().dek(v(1)).exists());

		let resumed = coordinator
			.resume(|request| {
				assert_eq!((request.from_version, request.to_version), (v(1), v(2)));
				Ok(MigrationReport {
					migrated: 1,
					..Default::default()
				})
			})
			.unwrap();
		assert_eq!(resumed.status, RotationStatus::Completed);
		assert_eq!(resumed.progress.migrated, 4);
		assert_eq!(resumed.progress.failed, 0);
		assert_eq!(resumed.attempts, 2);

		assert!(matches!(
			coordinator.resume(nothing_to_migrate),
			Err(RotationError::NothingToResume)
		));
	}

	#[test]
	fn interrupted_migration_is_failed() {
		let (_dir, coordinator) = coordinator();
		let err = coordinator
			.rotate(|_| {
				Err(MigrationError::Interrupted {
					source: StorageError::new("connection reset"),
					partial: MigrationReport {
						migrated: 2,
						..Default::default()
					},
				})
			})
			.unwrap_err();

		let record = err.record().unwrap();
		assert_eq!(record.progress.migrated, 2);
		assert!(record.last_error.as_deref().unwrap().contains("connection reset"));
		assert_eq!(
			coordinator.cipher.registry().latest_rotation().unwrap().status,
			RotationStatus::Failed
		);
	}

	#[test]
	fn resume_after_newer_rotation_is_stale() {
		let (_dir, coordinator) = coordinator();
		let _ = coordinator.rotate(|_| Err(MigrationError::Aborted("operator cancelled".into())));
		coordinator.cipher.registry().register_new_active(v(3)).unwrap();

		let err = coordinator.resume(nothing_to_migrate).unwrap_err();
		assert!(matches!(err, RotationError::StaleRotation { .. }));
	}

	#[test]
	fn concurrent_rotation_fails_fast() {
		let (_dir, coordinator) = coordinator();
		let held = KeyDirLock::try_acquire(&coordinator.cipher.store().paths().rotation_lock())
			.unwrap()
			.unwrap();

		let err = coordinator.rotate(nothing_to_migrate).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::RotationInProgress);
		assert_eq!(coordinator.cipher.registry().active_version().unwrap(), v(1));

		drop(held);
		coordinator.rotate(nothing_to_migrate).unwrap();
	}

	#[test]
	fn key_only_rotation_waits_for_migration() {
		let (_dir, coordinator) = coordinator();

		let record = coordinator.rotate_key_only().unwrap();
		assert_eq!(record.status, RotationStatus::Migrating);
		assert_eq!(record.attempts, 0);
		assert_eq!(coordinator.cipher.registry().active_version().unwrap(), v(2));

		let resumed = coordinator
			.resume(|request| {
				assert_eq!(request.source_versions(), [v(1)]);
				assert_eq!(request.to_version, v(2));
				Ok(MigrationReport::default())
			})
			.unwrap();
		assert_eq!(resumed.id, record.id);
		assert_eq!(resumed.status, RotationStatus::Completed);
	}

	#[test]
	fn later_rotation_migrates_every_older_version() {
		let (_dir, coordinator) = coordinator();
		let first = coordinator.rotate_key_only().unwrap();

		let second = coordinator
			.rotate(|request| {
				assert_eq!(request.from_version, v(2));
				assert_eq!(request.source_versions(), [v(1), v(2)]);
				Ok(MigrationReport::default())
			})
			.unwrap();
		assert_eq!(second.to_version, v(3));

		let rotations = coordinator.cipher.registry().rotations();
		let settled = rotations.iter().find(|r| r.id == first.id).unwrap();
		assert_eq!(settled.status, RotationStatus::Completed);
		assert!(matches!(
			coordinator.resume(nothing_to_migrate),
			Err(RotationError::NothingToResume)
		));
	}

	#[test]
	fn source_versions_stay_below_target() {
		let (_dir, coordinator) = coordinator();
		let request = MigrationRequest::new(7, v(2), v(3), &coordinator.cipher)
			.with_source_versions([v(4), v(1), v(2), v(1)]);
		assert_eq!(request.source_versions(), [v(1), v(2)]);
	}

	#[test]
	fn orphaned_key_file_is_skipped() {
		let (_dir, coordinator) = coordinator();
		coordinator
			.cipher
			.store()
			.persist_new_dek(&KeyMaterial::generate(KeyKind::Dek, v(2)))
			.unwrap();

		let record = coordinator.rotate(nothing_to_migrate).unwrap();
		assert_eq!(record.to_version, v(3));
	}
}
