// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! DEK wrapping under the KEK, used for key backup and restore.
//!
//! This is the only place the KEK is used: it encrypts other keys, never
//! application data.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cipher::{generate_nonce, open, seal};
use crate::envelope::NONCE_SIZE;
use crate::error::{CryptoError, KeyError};
use crate::material::KeyMaterial;
use crate::version::{KeyKind, KeyVersion};

/// A DEK version encrypted under the KEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
	pub version: KeyVersion,
	pub created_at: DateTime<Utc>,
	#[serde(with = "base64_bytes")]
	pub nonce: Vec<u8>,
	#[serde(with = "base64_bytes")]
	pub ciphertext: Vec<u8>,
}

fn wrap_aad(version: KeyVersion) -> Vec<u8> {
	format!("sealbox:dek-wrap:{version}").into_bytes()
}

/// Encrypt a DEK with the KEK.
pub fn wrap_dek(kek: &KeyMaterial, dek: &KeyMaterial) -> Result<WrappedKey, KeyError> {
	if kek.kind() != KeyKind::Kek {
		return Err(KeyError::WrongKind {
			expected: KeyKind::Kek,
			actual: kek.kind(),
		});
	}
	if dek.kind() != KeyKind::Dek {
		return Err(KeyError::WrongKind {
			expected: KeyKind::Dek,
			actual: dek.kind(),
		});
	}

	let nonce = generate_nonce();
	let ciphertext = seal(kek.expose(), &nonce, dek.expose(), &wrap_aad(dek.version()))
		.map_err(|_| KeyError::WrapFailed {
			version: dek.version(),
		})?;

	Ok(WrappedKey {
		version: dek.version(),
		created_at: dek.created_at(),
		nonce: nonce.to_vec(),
		ciphertext,
	})
}

/// Decrypt a DEK with the KEK.
pub fn unwrap_dek(kek: &KeyMaterial, wrapped: &WrappedKey) -> Result<KeyMaterial, KeyError> {
	if kek.kind() != KeyKind::Kek {
		return Err(KeyError::WrongKind {
			expected: KeyKind::Kek,
			actual: kek.kind(),
		});
	}

	let nonce: [u8; NONCE_SIZE] =
		wrapped
			.nonce
			.as_slice()
			.try_into()
			.map_err(|_| KeyError::UnwrapFailed {
				version: wrapped.version,
			})?;

	let plaintext = open(
		kek.expose(),
		&nonce,
		&wrapped.ciphertext,
		&wrap_aad(wrapped.version),
	)
	.map_err(|err| match err {
		CryptoError::DecryptionFailed => KeyError::UnwrapFailed {
			version: wrapped.version,
		},
		other => KeyError::RestoreRejected {
			version: wrapped.version,
			reason: other.to_string(),
		},
	})?;

	KeyMaterial::from_slice(KeyKind::Dek, wrapped.version, &plaintext, wrapped.created_at)
}

mod base64_bytes {
	use super::{Engine, BASE64};
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&BASE64.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let encoded = String::deserialize(deserializer)?;
		BASE64.decode(encoded).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ErrorKind;
	use proptest::prelude::*;

	fn kek() -> KeyMaterial {
		KeyMaterial::generate(KeyKind::Kek, KeyVersion::INITIAL)
	}

	#[test]
	fn dek_wrapping_roundtrip() {
		let kek = kek();
		let dek = KeyMaterial::generate(KeyKind::Dek, KeyVersion::INITIAL.next());

		let wrapped = wrap_dek(&kek, &dek).unwrap();
		let restored = unwrap_dek(&kek, &wrapped).unwrap();

		assert_eq!(restored.expose(), dek.expose());
		assert_eq!(restored.version(), dek.version());
	}

	#[test]
	fn wrong_kek_fails_unwrap() {
		let dek = KeyMaterial::generate(KeyKind::Dek, KeyVersion::INITIAL);
		let wrapped = wrap_dek(&kek(), &dek).unwrap();

		let err = unwrap_dek(&kek(), &wrapped).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
	}

	#[test]
	fn relabelled_version_fails_unwrap() {
		let kek = kek();
		let dek = KeyMaterial::generate(KeyKind::Dek, KeyVersion::INITIAL);
		let mut wrapped = wrap_dek(&kek, &dek).unwrap();
		wrapped.version = KeyVersion::INITIAL.next();

		assert!(unwrap_dek(&kek, &wrapped).is_err());
	}

	#[test]
	fn dek_cannot_wrap() {
		let dek = KeyMaterial::generate(KeyKind::Dek, KeyVersion::INITIAL);
		let err = wrap_dek(&dek, &dek).unwrap_err();
		assert!(matches!(err, KeyError::WrongKind { .. }));
	}

	#[test]
	fn wrapped_key_json_roundtrip() {
		let wrapped = wrap_dek(&kek(), &KeyMaterial::generate(KeyKind::Dek, KeyVersion::INITIAL))
			.unwrap();
		let json = serde_json::to_string(&wrapped).unwrap();
		let parsed: WrappedKey = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed, wrapped);
	}

	proptest! {
		#[test]
		fn prop_wrong_kek_never_unwraps(seed in any::<u8>()) {
			let dek = KeyMaterial::generate(KeyKind::Dek, KeyVersion::INITIAL);
			let wrapped = wrap_dek(&kek(), &dek).unwrap();
			let other = KeyMaterial::from_slice(KeyKind::Kek, KeyVersion::INITIAL, &[seed; 32], Utc::now()).unwrap();
			prop_assert!(unwrap_dek(&other, &wrapped).is_err());
		}
	}
}
