// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Raw key material.

use std::fmt;

use aes_gcm::aead::OsRng;
use chrono::{DateTime, Utc};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::KeyError;
use crate::version::{KeyKind, KeyVersion};

/// Size of encryption keys in bytes (256 bits for AES-256).
pub const KEY_SIZE: usize = 32;

/// Generate a random encryption key.
pub fn generate_key() -> Zeroizing<[u8; KEY_SIZE]> {
	let mut key = Zeroizing::new([0u8; KEY_SIZE]);
	OsRng.fill_bytes(key.as_mut());
	key
}

/// A KEK or one version of the DEK. Bytes are zeroized on drop and never
/// printed by `Debug`.
pub struct KeyMaterial {
	bytes: Zeroizing<[u8; KEY_SIZE]>,
	kind: KeyKind,
	version: KeyVersion,
	created_at: DateTime<Utc>,
}

impl KeyMaterial {
	/// Fresh material from the OS CSPRNG.
	pub fn generate(kind: KeyKind, version: KeyVersion) -> Self {
		Self {
			bytes: generate_key(),
			kind,
			version,
			created_at: Utc::now(),
		}
	}

	/// Wraps existing bytes. Anything other than exactly [`KEY_SIZE`] bytes is
	/// rejected; keys are never truncated or padded.
	pub fn from_slice(
		kind: KeyKind,
		version: KeyVersion,
		bytes: &[u8],
		created_at: DateTime<Utc>,
	) -> Result<Self, KeyError> {
		if bytes.len() != KEY_SIZE {
			return Err(KeyError::InvalidKeySize {
				expected: KEY_SIZE,
				actual: bytes.len() as u64,
				path: None,
			});
		}

		let mut key = Zeroizing::new([0u8; KEY_SIZE]);
		key.copy_from_slice(bytes);
		Ok(Self {
			bytes: key,
			kind,
			version,
			created_at,
		})
	}

	pub fn expose(&self) -> &[u8; KEY_SIZE] {
		&self.bytes
	}

	pub fn kind(&self) -> KeyKind {
		self.kind
	}

	pub fn version(&self) -> KeyVersion {
		self.version
	}

	pub fn created_at(&self) -> DateTime<Utc> {
		self.created_at
	}
}

impl fmt::Debug for KeyMaterial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KeyMaterial")
			.field("kind", &self.kind)
			.field("version", &self.version)
			.field("created_at", &self.created_at)
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}
