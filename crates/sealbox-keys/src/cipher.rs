// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! AES-256-GCM envelope encryption under the versioned DEK.

use std::sync::Arc;

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng, Payload},
	Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::envelope::{Algorithm, Envelope, NONCE_SIZE, TAG_SIZE};
use crate::error::{CryptoError, KeyError};
use crate::material::KEY_SIZE;
use crate::registry::KeyVersionRegistry;
use crate::store::KeyMaterialStore;
use crate::version::{KeyId, KeyVersion};

/// Generate a random nonce.
///
/// Every call draws 96 fresh bits from `OsRng`; nothing is shared across
/// calls or processes, so restarts cannot replay a nonce. The same
/// (key, nonce) pair must never be reused.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);
	nonce
}

pub(crate) fn seal(
	key: &[u8; KEY_SIZE],
	nonce: &[u8; NONCE_SIZE],
	plaintext: &[u8],
	aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	cipher
		.encrypt(
			Nonce::from_slice(nonce),
			Payload {
				msg: plaintext,
				aad,
			},
		)
		.map_err(|_| CryptoError::EncryptionFailed)
}

/// Every failure, whatever its cause, is reported as the same
/// [`CryptoError::DecryptionFailed`].
pub(crate) fn open(
	key: &[u8; KEY_SIZE],
	nonce: &[u8; NONCE_SIZE],
	ciphertext: &[u8],
	aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
	cipher
		.decrypt(
			Nonce::from_slice(nonce),
			Payload {
				msg: ciphertext,
				aad,
			},
		)
		.map(Zeroizing::new)
		.map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypts payloads under the active DEK and decrypts them under whichever
/// version they record.
#[derive(Debug, Clone)]
pub struct EnvelopeCipher {
	store: Arc<KeyMaterialStore>,
	registry: Arc<KeyVersionRegistry>,
}

impl EnvelopeCipher {
	pub fn new(store: Arc<KeyMaterialStore>, registry: Arc<KeyVersionRegistry>) -> Self {
		Self { store, registry }
	}

	/// Encrypt with the currently active key version, as recorded on disk.
	///
	/// Another process may have rotated, so the registry is re-read whenever
	/// its file changed since this process last looked.
	pub fn encrypt(&self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<Envelope, CryptoError> {
		if self.registry.refresh()? {
			debug!("key registry changed on disk");
		}
		let version = self.registry.active_version()?;
		self.encrypt_with_version(version, plaintext, aad)
	}

	/// Encrypt with a specific, registered key version.
	pub fn encrypt_with_version(
		&self,
		version: KeyVersion,
		plaintext: &[u8],
		aad: Option<&[u8]>,
	) -> Result<Envelope, CryptoError> {
		if !self.registry.is_known(version) {
			return Err(self.not_found(version));
		}
		let key = self.store.load_key(KeyId::Dek(version))?;

		let mut envelope = Envelope {
			ciphertext: Vec::new(),
			nonce: generate_nonce(),
			key_version: version,
			algorithm: Algorithm::Aes256Gcm,
			aad: aad.map(<[u8]>::to_vec),
		};
		envelope.ciphertext = seal(
			key.expose(),
			&envelope.nonce,
			plaintext,
			&envelope.associated_data(),
		)?;
		Ok(envelope)
	}

	/// Decrypt with the key version recorded in the envelope, active or retired.
	///
	/// An unknown version triggers one registry reload, since another process
	/// may have rotated since this one last looked.
	pub fn decrypt(&self, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
		if envelope.ciphertext.len() < TAG_SIZE {
			return Err(CryptoError::MalformedEnvelope(format!(
				"ciphertext too short ({} bytes)",
				envelope.ciphertext.len()
			)));
		}

		let version = envelope.key_version;
		if !self.registry.is_known(version) {
			debug!(version = %version, "unknown key version, reloading registry");
			self.registry.reload()?;
			if !self.registry.is_known(version) {
				return Err(self.not_found(version));
			}
		}

		let key = self.store.load_key(KeyId::Dek(version))?;
		open(
			key.expose(),
			&envelope.nonce,
			&envelope.ciphertext,
			&envelope.associated_data(),
		)
	}

	/// Moves an envelope onto `to`, keeping its associated data.
	///
	/// Returns `None` when the envelope already uses `to`, which keeps
	/// migrations idempotent.
	#[instrument(skip_all, fields(from = %envelope.key_version, to = %to))]
	pub fn reencrypt(
		&self,
		envelope: &Envelope,
		to: KeyVersion,
	) -> Result<Option<Envelope>, CryptoError> {
		if envelope.key_version == to {
			return Ok(None);
		}
		let plaintext = self.decrypt(envelope)?;
		self.encrypt_with_version(to, &plaintext, envelope.aad.as_deref())
			.map(Some)
	}

	pub fn store(&self) -> &Arc<KeyMaterialStore> {
		&self.store
	}

	pub fn registry(&self) -> &Arc<KeyVersionRegistry> {
		&self.registry
	}

	fn not_found(&self, version: KeyVersion) -> CryptoError {
		CryptoError::Key(KeyError::KeyNotFound {
			kind: crate::version::KeyKind::Dek,
			version,
			path: self.store.paths().dek(version),
		})
	}
}
