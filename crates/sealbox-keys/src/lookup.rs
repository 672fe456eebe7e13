// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Deterministic lookup hashes for encrypted tokens.
//!
//! Envelopes use random nonces, so a presented token cannot be matched by
//! re-encrypting it. Storage indexes an HMAC-SHA256 of the token instead and
//! keeps the envelope opaque. The HMAC key is derived from the KEK under a
//! fixed label, so it survives DEK rotation.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::envelope::RecordKind;
use crate::error::KeyError;
use crate::material::{KeyMaterial, KEY_SIZE};
use crate::version::KeyKind;

type HmacSha256 = Hmac<Sha256>;

const LOOKUP_KEY_LABEL: &[u8] = b"sealbox:lookup-key:v1";

/// Computes and verifies lookup hashes.
pub struct LookupHasher {
	key: Zeroizing<[u8; KEY_SIZE]>,
}

impl LookupHasher {
	pub fn from_kek(kek: &KeyMaterial) -> Result<Self, KeyError> {
		if kek.kind() != KeyKind::Kek {
			return Err(KeyError::WrongKind {
				expected: KeyKind::Kek,
				actual: kek.kind(),
			});
		}

		let mut mac =
			HmacSha256::new_from_slice(kek.expose()).expect("HMAC can take key of any size");
		mac.update(LOOKUP_KEY_LABEL);
		let mut key = Zeroizing::new([0u8; KEY_SIZE]);
		key.copy_from_slice(&mac.finalize().into_bytes());
		Ok(Self { key })
	}

	fn mac(&self, kind: &RecordKind, token: &[u8]) -> HmacSha256 {
		let mut mac =
			HmacSha256::new_from_slice(self.key.as_slice()).expect("HMAC can take key of any size");
		mac.update(kind.as_str().as_bytes());
		mac.update(&[0]);
		mac.update(token);
		mac
	}

	/// Hex-encoded hash of `token`, scoped to the record kind.
	pub fn hash(&self, kind: &RecordKind, token: &[u8]) -> String {
		hex::encode(self.mac(kind, token).finalize().into_bytes())
	}

	/// Constant-time comparison of `token` against a stored hash.
	pub fn matches(&self, kind: &RecordKind, token: &[u8], stored: &str) -> bool {
		let Ok(expected) = hex::decode(stored) else {
			return false;
		};
		self.mac(kind, token).verify_slice(&expected).is_ok()
	}
}

impl std::fmt::Debug for LookupHasher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LookupHasher").finish_non_exhaustive()
	}
}
