// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The envelope value stored by callers.
//!
//! An [`Envelope`] is split into two columns for storage: the ciphertext and
//! a compact JSON metadata string (`{"v":1,"alg":"AES-256-GCM","key_version":"1","nonce":"..."}`).
//! Both are required to reassemble it. The metadata header is also bound
//! into the AEAD associated data, so pairing ciphertext with another
//! record's metadata fails authentication.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::version::KeyVersion;

/// Size of AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Current metadata format.
pub const ENVELOPE_FORMAT: u8 = 1;

/// AEAD algorithm recorded in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Algorithm {
	#[default]
	#[serde(rename = "AES-256-GCM")]
	Aes256Gcm,
}

impl Algorithm {
	pub fn as_str(&self) -> &'static str {
		match self {
			Algorithm::Aes256Gcm => "AES-256-GCM",
		}
	}
}

impl fmt::Display for Algorithm {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Algorithm {
	type Err = CryptoError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"AES-256-GCM" => Ok(Algorithm::Aes256Gcm),
			other => Err(CryptoError::MalformedEnvelope(format!(
				"unsupported algorithm {other:?}"
			))),
		}
	}
}

/// Logical record types protected by this crate. The canonical string is
/// used as associated data so a ciphertext cannot be replayed as a
/// different kind of record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKind {
	SessionToken,
	ApiClientSecret,
	ApiToken,
	PasswordResetToken,
	SecretValue,
	Custom(String),
}

impl RecordKind {
	pub fn as_str(&self) -> &str {
		match self {
			RecordKind::SessionToken => "session-token",
			RecordKind::ApiClientSecret => "api-client-secret",
			RecordKind::ApiToken => "api-token",
			RecordKind::PasswordResetToken => "password-reset-token",
			RecordKind::SecretValue => "secret-value",
			RecordKind::Custom(name) => name,
		}
	}

	pub fn aad(&self) -> &[u8] {
		self.as_str().as_bytes()
	}
}

impl fmt::Display for RecordKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RecordKind {
	type Err = std::convert::Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"session-token" => RecordKind::SessionToken,
			"api-client-secret" => RecordKind::ApiClientSecret,
			"api-token" => RecordKind::ApiToken,
			"password-reset-token" => RecordKind::PasswordResetToken,
			"secret-value" => RecordKind::SecretValue,
			other => RecordKind::Custom(other.to_string()),
		})
	}
}

/// Encrypted payload plus everything needed to decrypt it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
	pub ciphertext: Vec<u8>,
	pub nonce: [u8; NONCE_SIZE],
	pub key_version: KeyVersion,
	pub algorithm: Algorithm,
	pub aad: Option<Vec<u8>>,
}

/// The metadata column of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
	#[serde(rename = "v")]
	pub format: u8,
	#[serde(rename = "alg")]
	pub algorithm: Algorithm,
	pub key_version: KeyVersion,
	/// Base64 nonce.
	pub nonce: String,
	/// Base64 associated data, when the record carries any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub aad: Option<String>,
}

impl Envelope {
	pub fn metadata(&self) -> EnvelopeMetadata {
		EnvelopeMetadata {
			format: ENVELOPE_FORMAT,
			algorithm: self.algorithm,
			key_version: self.key_version,
			nonce: BASE64.encode(self.nonce),
			aad: self.aad.as_ref().map(|aad| BASE64.encode(aad)),
		}
	}

	/// Metadata serialized for the dedicated metadata column.
	pub fn encode_metadata(&self) -> Result<String, CryptoError> {
		serde_json::to_string(&self.metadata())
			.map_err(|e| CryptoError::MalformedEnvelope(format!("cannot encode metadata: {e}")))
	}

	/// Splits into the `(ciphertext, metadata)` column pair.
	pub fn into_parts(self) -> Result<(Vec<u8>, String), CryptoError> {
		let metadata = self.encode_metadata()?;
		Ok((self.ciphertext, metadata))
	}

	/// Reassembles an envelope from its two storage columns.
	pub fn from_parts(ciphertext: Vec<u8>, metadata: &str) -> Result<Self, CryptoError> {
		if metadata.trim().is_empty() {
			return Err(CryptoError::MalformedEnvelope("missing metadata".into()));
		}
		if ciphertext.len() < TAG_SIZE {
			return Err(CryptoError::MalformedEnvelope(format!(
				"ciphertext too short ({} bytes)",
				ciphertext.len()
			)));
		}

		let metadata: EnvelopeMetadata = serde_json::from_str(metadata)
			.map_err(|e| CryptoError::MalformedEnvelope(format!("invalid metadata: {e}")))?;
		if metadata.format != ENVELOPE_FORMAT {
			return Err(CryptoError::MalformedEnvelope(format!(
				"unsupported metadata format {}",
				metadata.format
			)));
		}

		let nonce_bytes = BASE64
			.decode(&metadata.nonce)
			.map_err(|e| CryptoError::MalformedEnvelope(format!("invalid nonce encoding: {e}")))?;
		let nonce: [u8; NONCE_SIZE] = nonce_bytes.as_slice().try_into().map_err(|_| {
			CryptoError::MalformedEnvelope(format!(
				"nonce must be {NONCE_SIZE} bytes, got {}",
				nonce_bytes.len()
			))
		})?;

		let aad = metadata
			.aad
			.map(|encoded| BASE64.decode(encoded))
			.transpose()
			.map_err(|e| CryptoError::MalformedEnvelope(format!("invalid aad encoding: {e}")))?;

		Ok(Self {
			ciphertext,
			nonce,
			key_version: metadata.key_version,
			algorithm: metadata.algorithm,
			aad,
		})
	}

	/// Associated data fed to the AEAD: a header binding format, algorithm
	/// and key version, followed by the caller's AAD.
	pub(crate) fn associated_data(&self) -> Vec<u8> {
		let header = format!(
			"sealbox:v{}:{}:{}\0",
			ENVELOPE_FORMAT, self.algorithm, self.key_version
		);
		let mut data = header.into_bytes();
		if let Some(aad) = &self.aad {
			data.extend_from_slice(aad);
		}
		data
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ErrorKind;

	fn sample() -> Envelope {
		Envelope {
			ciphertext: vec![0xAB; 40],
			nonce: [3u8; NONCE_SIZE],
			key_version: KeyVersion::INITIAL,
			algorithm: Algorithm::Aes256Gcm,
			aad: Some(b"session-token".to_vec()),
		}
	}

	#[test]
	fn parts_roundtrip() {
		let envelope = sample();
		let (ciphertext, metadata) = envelope.clone().into_parts().unwrap();
		assert!(metadata.contains("\"alg\":\"AES-256-GCM\""));
		assert!(metadata.contains("\"key_version\":\"1\""));

		let restored = Envelope::from_parts(ciphertext, &metadata).unwrap();
		assert_eq!(restored, envelope);
	}

	#[test]
	fn metadata_without_aad_omits_field() {
		let mut envelope = sample();
		envelope.aad = None;
		let metadata = envelope.encode_metadata().unwrap();
		assert!(!metadata.contains("aad"));
	}

	#[test]
	fn missing_metadata_is_rejected() {
		let err = Envelope::from_parts(vec![0; 32], "  ").unwrap_err();
		assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
	}

	#[test]
	fn missing_ciphertext_is_rejected() {
		let metadata = sample().encode_metadata().unwrap();
		let err = Envelope::from_parts(Vec::new(), &metadata).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
	}

	#[test]
	fn unknown_algorithm_is_rejected() {
		let metadata = sample()
			.encode_metadata()
			.unwrap()
			.replace("AES-256-GCM", "ROT13");
		let err = Envelope::from_parts(vec![0; 32], &metadata).unwrap_err();
		assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
	}

	#[test]
	fn short_nonce_is_rejected() {
		let mut metadata = sample().metadata();
		metadata.nonce = BASE64.encode([1u8; 8]);
		let json = serde_json::to_string(&metadata).unwrap();
		let err = Envelope::from_parts(vec![0; 32], &json).unwrap_err();
		assert!(err.to_string().contains("nonce must be 12 bytes"));
	}

	#[test]
	fn associated_data_binds_key_version() {
		let envelope = sample();
		let mut other = sample();
		other.key_version = KeyVersion::INITIAL.next();
		assert_ne!(envelope.associated_data(), other.associated_data());
		assert!(envelope.associated_data().ends_with(b"session-token"));
	}

	#[test]
	fn record_kind_strings() {
		assert_eq!(RecordKind::PasswordResetToken.as_str(), "password-reset-token");
		assert_eq!("api-token".parse::<RecordKind>().unwrap(), RecordKind::ApiToken);
		assert_eq!(
			"webhook-secret".parse::<RecordKind>().unwrap(),
			RecordKind::Custom("webhook-secret".into())
		);
	}
}
