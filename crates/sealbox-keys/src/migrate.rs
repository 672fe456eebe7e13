// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Re-encryption of stored envelopes during rotation.
//!
//! Storage only supplies enumeration and rewrite primitives through
//! [`EnvelopeStorage`]; [`StorageMigrator`] owns batching, retries and
//! per-record failure reporting.

use sealbox_config::RotationConfig;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::envelope::Envelope;
use crate::error::{MigrationError, StorageError};
use crate::rotation::{MigrationRequest, RecordFailure};
use crate::version::KeyVersion;

/// Envelopes yielded by storage, keyed by record id.
pub type EnvelopeIter<'a> = Box<dyn Iterator<Item = Result<(String, Envelope), StorageError>> + 'a>;

/// The storage layer holding envelopes. Implemented outside this crate.
pub trait EnvelopeStorage {
	/// Every stored envelope whose recorded key version is `version`.
	fn enumerate_envelopes_by_key_version(
		&self,
		version: KeyVersion,
	) -> Result<EnvelopeIter<'_>, StorageError>;

	/// Replaces the envelope stored for `record_id`.
	fn rewrite_envelope(&self, record_id: &str, envelope: Envelope) -> Result<(), StorageError>;
}

/// Outcome of one migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
	pub migrated: u64,
	/// Records already on the target version.
	pub skipped: u64,
	pub failures: Vec<RecordFailure>,
}

impl MigrationReport {
	pub fn is_complete(&self) -> bool {
		self.failures.is_empty()
	}
}

/// Migration callback built on an [`EnvelopeStorage`].
#[derive(Debug)]
pub struct StorageMigrator<'a, S: ?Sized> {
	storage: &'a S,
	batch_size: usize,
	max_attempts: u32,
}

impl<'a, S: EnvelopeStorage + ?Sized> StorageMigrator<'a, S> {
	pub fn new(storage: &'a S, config: &RotationConfig) -> Self {
		Self {
			storage,
			batch_size: config.batch_size.max(1),
			max_attempts: config.max_record_attempts.max(1),
		}
	}

	/// Re-encrypts every envelope on one of `request.source_versions()`.
	///
	/// A record that cannot be decrypted or rewritten is reported in the
	/// returned failures and the pass continues. Only a broken enumeration
	/// ends the pass early, as [`MigrationError::Interrupted`].
	#[instrument(skip_all, fields(from = %request.from_version, to = %request.to_version))]
	pub fn run(&self, request: &MigrationRequest<'_>) -> Result<MigrationReport, MigrationError> {
		let mut report = MigrationReport::default();
		let mut batch = Vec::with_capacity(self.batch_size);
		let mut batch_number = 0usize;

		for &version in request.source_versions() {
			let records = match self.storage.enumerate_envelopes_by_key_version(version) {
				Ok(records) => records,
				Err(source) => {
					warn!(version = %version, error = %source, "envelope enumeration failed");
					return Err(MigrationError::Interrupted {
						source,
						partial: report,
					});
				}
			};
			debug!(version = %version, "migrating envelopes");

			for item in records {
				match item {
					Ok(record) => batch.push(record),
					Err(source) => {
						self.process_batch(request, batch_number, &mut batch, &mut report);
						warn!(error = %source, "envelope enumeration failed");
						return Err(MigrationError::Interrupted {
							source,
							partial: report,
						});
					}
				}
				if batch.len() >= self.batch_size {
					self.process_batch(request, batch_number, &mut batch, &mut report);
					batch_number += 1;
				}
			}
		}
		self.process_batch(request, batch_number, &mut batch, &mut report);

		info!(
			migrated = report.migrated,
			skipped = report.skipped,
			failed = report.failures.len(),
			"migration pass finished"
		);
		Ok(report)
	}

	fn process_batch(
		&self,
		request: &MigrationRequest<'_>,
		batch_number: usize,
		batch: &mut Vec<(String, Envelope)>,
		report: &mut MigrationReport,
	) {
		if batch.is_empty() {
			return;
		}
		debug!(batch = batch_number, records = batch.len(), "migrating batch");

		for (record_id, envelope) in batch.drain(..) {
			let replacement = match request.reencrypt(&envelope) {
				Ok(Some(replacement)) => replacement,
				Ok(None) => {
					report.skipped += 1;
					continue;
				}
				Err(e) => {
					warn!(record_id = %record_id, error = %e, "cannot re-encrypt record");
					report.failures.push(RecordFailure {
						record_id,
						reason: e.to_string(),
					});
					continue;
				}
			};

			match self.rewrite_with_retry(&record_id, replacement) {
				Ok(()) => report.migrated += 1,
				Err(e) => {
					warn!(record_id = %record_id, error = %e, "cannot rewrite record");
					report.failures.push(RecordFailure {
						record_id,
						reason: e.to_string(),
					});
				}
			}
		}
	}

	fn rewrite_with_retry(&self, record_id: &str, envelope: Envelope) -> Result<(), StorageError> {
		let mut attempt = 1;
		loop {
			match self.storage.rewrite_envelope(record_id, envelope.clone()) {
				Ok(()) => return Ok(()),
				Err(e) if e.transient && attempt < self.max_attempts => {
					debug!(record_id, attempt, error = %e, "retrying rewrite");
					attempt += 1;
				}
				Err(e) => return Err(e),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::sync::Arc;

	use parking_lot::Mutex;
	use sealbox_config::{EncryptionConfig, PermissionsConfig};

	use crate::cipher::EnvelopeCipher;
	use crate::material::KeyMaterial;
	use crate::registry::KeyVersionRegistry;
	use crate::store::KeyMaterialStore;
	use crate::version::KeyKind;

	#[derive(Default)]
	struct MemoryStorage {
		records: Mutex<HashMap<String, Envelope>>,
		transient_failures: Mutex<HashMap<String, u32>>,
		broken: Mutex<Vec<String>>,
	}

	impl EnvelopeStorage for MemoryStorage {
		fn enumerate_envelopes_by_key_version(
			&self,
			version: KeyVersion,
		) -> Result<EnvelopeIter<'_>, StorageError> {
			let records = self.records.lock();
			let mut ids: Vec<_> = records
				.iter()
				.filter(|(_, e)| e.key_version == version)
				.map(|(id, _)| id.clone())
				.collect();
			ids.sort();
			let matching: Vec<_> = ids
				.into_iter()
				.map(|id| {
					let envelope = records[&id].clone();
					Ok((id, envelope))
				})
				.collect();
			Ok(Box::new(matching.into_iter()))
		}

		fn rewrite_envelope(&self, record_id: &str, envelope: Envelope) -> Result<(), StorageError> {
			if self.broken.lock().iter().any(|id| id == record_id) {
				return Err(StorageError::new("constraint violation"));
			}
			if let Some(remaining) = self.transient_failures.lock().get_mut(record_id) {
				if *remaining > 0 {
					*remaining -= 1;
					return Err(StorageError::transient("database is locked"));
				}
			}
			self.records.lock().insert(record_id.to_string(), envelope);
			Ok(())
		}
	}

	struct Fixture {
		_dir: tempfile::TempDir,
		cipher: EnvelopeCipher,
		to: KeyVersion,
	}

	fn fixture() -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let config = EncryptionConfig::with_key_dir(dir.path());
		let store = Arc::new(KeyMaterialStore::from_config(
			&config,
			&PermissionsConfig::default(),
		));
		let registry = Arc::new(KeyVersionRegistry::open(config.registry_path()).unwrap());
		store.initialize(&registry).unwrap();
		let to = KeyVersion::INITIAL.next();
		store
			.persist_new_dek(&KeyMaterial::generate(KeyKind::Dek, to))
			.unwrap();
		Fixture {
			_dir: dir,
			cipher: EnvelopeCipher::new(store, registry),
			to,
		}
	}

	fn seed(f: &Fixture, storage: &MemoryStorage, count: usize) {
		for i in 0..count {
			let envelope = f
				.cipher
				.encrypt(format!("secret-{i}").as_bytes(), None)
				.unwrap();
			storage.records.lock().insert(format!("rec-{i:03}"), envelope);
		}
	}

	fn request(f: &Fixture) -> MigrationRequest<'_> {
		MigrationRequest::new(1, KeyVersion::INITIAL, f.to, &f.cipher)
	}

	fn config(batch_size: usize, attempts: u32) -> RotationConfig {
		RotationConfig {
			batch_size,
			max_record_attempts: attempts,
		}
	}

	#[test]
	fn migrates_every_record_across_batches() {
		let f = fixture();
		let storage = MemoryStorage::default();
		seed(&f, &storage, 7);
		f.cipher.registry().register_new_active(f.to).unwrap();

		let report = StorageMigrator::new(&storage, &config(3, 1))
			.run(&request(&f))
			.unwrap();

		assert_eq!(report.migrated, 7);
		assert!(report.is_complete());
		for envelope in storage.records.lock().values() {
			assert_eq!(envelope.key_version, f.to);
			assert!(f.cipher.decrypt(envelope).is_ok());
		}
	}

	#[test]
	fn transient_rewrite_errors_are_retried() {
		let f = fixture();
		let storage = MemoryStorage::default();
		seed(&f, &storage, 2);
		f.cipher.registry().register_new_active(f.to).unwrap();
		storage
			.transient_failures
			.lock()
			.insert("rec-000".to_string(), 2);

		let report = StorageMigrator::new(&storage, &config(10, 3))
			.run(&request(&f))
			.unwrap();
		assert_eq!(report.migrated, 2);
		assert!(report.is_complete());
	}

	#[test]
	fn permanent_failures_are_reported_per_record() {
		let f = fixture();
		let storage = MemoryStorage::default();
		seed(&f, &storage, 3);
		f.cipher.registry().register_new_active(f.to).unwrap();
		storage.broken.lock().push("rec-001".to_string());

		let report = StorageMigrator::new(&storage, &config(10, 3))
			.run(&request(&f))
			.unwrap();

		assert_eq!(report.migrated, 2);
		assert_eq!(report.failures.len(), 1);
		assert_eq!(report.failures[0].record_id, "rec-001");
		assert_eq!(
			storage.records.lock()["rec-001"].key_version,
			KeyVersion::INITIAL
		);
	}

	#[test]
	fn second_pass_finds_nothing_left() {
		let f = fixture();
		let storage = MemoryStorage::default();
		seed(&f, &storage, 4);
		f.cipher.registry().register_new_active(f.to).unwrap();
		let migrator = StorageMigrator::new(&storage, &config(2, 1));

		migrator.run(&request(&f)).unwrap();
		let before: HashMap<_, _> = storage.records.lock().clone();
		let again = migrator.run(&request(&f)).unwrap();

		assert_eq!(again, MigrationReport::default());
		assert_eq!(*storage.records.lock(), before);
	}
}
