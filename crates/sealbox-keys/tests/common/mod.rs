// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared fixtures for sealbox-keys integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use parking_lot::Mutex;
use sealbox_config::{EncryptionConfig, SealboxConfig};
use sealbox_keys::{Envelope, EnvelopeIter, EnvelopeStorage, KeyService, KeyVersion, StorageError};
use tempfile::TempDir;

pub fn config_for(key_dir: &Path) -> SealboxConfig {
	SealboxConfig {
		encryption: EncryptionConfig::with_key_dir(key_dir),
		..SealboxConfig::default()
	}
}

/// An initialized service rooted in a fresh temp directory.
pub fn setup_service() -> (KeyService, TempDir) {
	let dir = tempfile::tempdir().unwrap();
	let service = KeyService::open(&config_for(&dir.path().join("keys"))).unwrap();
	service.initialize().unwrap();
	(service, dir)
}

/// Stores envelopes as the `(ciphertext, metadata)` column pair a database
/// would, reassembling them on read.
#[derive(Default)]
pub struct MemoryStorage {
	rows: Mutex<BTreeMap<String, (Vec<u8>, String)>>,
	fail_rewrites: Mutex<HashSet<String>>,
	rewrites: Mutex<u64>,
}

impl MemoryStorage {
	pub fn insert(&self, record_id: &str, envelope: Envelope) {
		let row = envelope.into_parts().unwrap();
		self.rows.lock().insert(record_id.to_string(), row);
	}

	pub fn get(&self, record_id: &str) -> Envelope {
		let (ciphertext, metadata) = self.rows.lock()[record_id].clone();
		Envelope::from_parts(ciphertext, &metadata).unwrap()
	}

	pub fn record_ids(&self) -> Vec<String> {
		self.rows.lock().keys().cloned().collect()
	}

	pub fn fail_rewrites_for(&self, record_id: &str) {
		self.fail_rewrites.lock().insert(record_id.to_string());
	}

	pub fn heal(&self) {
		self.fail_rewrites.lock().clear();
	}

	pub fn rewrites(&self) -> u64 {
		*self.rewrites.lock()
	}
}

impl EnvelopeStorage for MemoryStorage {
	fn enumerate_envelopes_by_key_version(
		&self,
		version: KeyVersion,
	) -> Result<EnvelopeIter<'_>, StorageError> {
		let matching: Vec<_> = self
			.rows
			.lock()
			.iter()
			.map(|(id, (ciphertext, metadata))| {
				Envelope::from_parts(ciphertext.clone(), metadata)
					.map(|envelope| (id.clone(), envelope))
					.map_err(|e| StorageError::new(e.to_string()))
			})
			.filter(|row| match row {
				Ok((_, envelope)) => envelope.key_version == version,
				Err(_) => true,
			})
			.collect();
		Ok(Box::new(matching.into_iter()))
	}

	fn rewrite_envelope(&self, record_id: &str, envelope: Envelope) -> Result<(), StorageError> {
		if self.fail_rewrites.lock().contains(record_id) {
			return Err(StorageError::new(format!("row {record_id} is read-only")));
		}
		let row = envelope
			.into_parts()
			.map_err(|e| StorageError::new(e.to_string()))?;
		self.rows.lock().insert(record_id.to_string(), row);
		*self.rewrites.lock() += 1;
		Ok(())
	}
}
