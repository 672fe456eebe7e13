// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key version identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of one generation of the data encryption key.
///
/// Versions start at `1` and only ever increase. They are rendered and
/// serialized as decimal strings (`"1"`, `"2"`) so they can be stored
/// verbatim in text metadata columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyVersion(u64);

impl KeyVersion {
	/// Version assigned to the DEK created by `initialize`.
	pub const INITIAL: KeyVersion = KeyVersion(1);

	/// Returns `None` for zero, which is never a valid version.
	#[must_use]
	pub fn new(value: u64) -> Option<Self> {
		(value > 0).then_some(Self(value))
	}

	#[must_use]
	pub fn get(self) -> u64 {
		self.0
	}

	#[must_use]
	pub fn next(self) -> Self {
		Self(self.0.saturating_add(1))
	}
}

impl fmt::Display for KeyVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for KeyVersion {
	type Err = InvalidKeyVersion;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.trim()
			.parse::<u64>()
			.ok()
			.and_then(KeyVersion::new)
			.ok_or_else(|| InvalidKeyVersion(s.to_string()))
	}
}

impl Serialize for KeyVersion {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for KeyVersion {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		raw.parse().map_err(serde::de::Error::custom)
	}
}

/// A string that is not a valid key version.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid key version: {0:?}")]
pub struct InvalidKeyVersion(pub String);

/// Role of a key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
	/// Key-encryption key: only ever wraps other keys.
	Kek,
	/// Data-encryption key: encrypts application payloads.
	Dek,
}

impl fmt::Display for KeyKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			KeyKind::Kek => write!(f, "KEK"),
			KeyKind::Dek => write!(f, "DEK"),
		}
	}
}

/// Address of a key file in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyId {
	Kek,
	Dek(KeyVersion),
}

impl KeyId {
	#[must_use]
	pub fn kind(&self) -> KeyKind {
		match self {
			KeyId::Kek => KeyKind::Kek,
			KeyId::Dek(_) => KeyKind::Dek,
		}
	}

	/// The KEK is never rotated, so it always reports the initial version.
	#[must_use]
	pub fn version(&self) -> KeyVersion {
		match self {
			KeyId::Kek => KeyVersion::INITIAL,
			KeyId::Dek(version) => *version,
		}
	}
}

impl fmt::Display for KeyId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			KeyId::Kek => write!(f, "KEK"),
			KeyId::Dek(version) => write!(f, "DEK v{version}"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_is_not_a_version() {
		assert!(KeyVersion::new(0).is_none());
		assert!("0".parse::<KeyVersion>().is_err());
	}

	#[test]
	fn parse_and_display_roundtrip() {
		let version: KeyVersion = "42".parse().unwrap();
		assert_eq!(version.get(), 42);
		assert_eq!(version.to_string(), "42");
		assert!("v2".parse::<KeyVersion>().is_err());
		assert!("".parse::<KeyVersion>().is_err());
	}

	#[test]
	fn serializes_as_string() {
		let json = serde_json::to_string(&KeyVersion::INITIAL).unwrap();
		assert_eq!(json, "\"1\"");
		let parsed: KeyVersion = serde_json::from_str("\"7\"").unwrap();
		assert_eq!(parsed.get(), 7);
		assert!(serde_json::from_str::<KeyVersion>("7").is_err());
	}

	#[test]
	fn next_increments() {
		assert_eq!(KeyVersion::INITIAL.next().get(), 2);
		assert!(KeyVersion::INITIAL.next() > KeyVersion::INITIAL);
	}
}
