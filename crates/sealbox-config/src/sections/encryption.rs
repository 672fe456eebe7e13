// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encryption and key file layout configuration section.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_KEY_DIR: &str = "/var/lib/sealbox/keys";
pub const DEFAULT_KEK_FILE: &str = "kek.key";
pub const DEFAULT_DEK_FILE: &str = "dek.key";
pub const DEFAULT_REGISTRY_FILE: &str = "keys.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncryptionConfigLayer {
	pub enabled: Option<bool>,
	pub key_dir: Option<PathBuf>,
	pub kek_file: Option<PathBuf>,
	pub dek_file: Option<PathBuf>,
	pub registry_file: Option<PathBuf>,
	pub strict_permissions: Option<bool>,
}

impl EncryptionConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.enabled.is_some() {
			self.enabled = other.enabled;
		}
		if other.key_dir.is_some() {
			self.key_dir = other.key_dir;
		}
		if other.kek_file.is_some() {
			self.kek_file = other.kek_file;
		}
		if other.dek_file.is_some() {
			self.dek_file = other.dek_file;
		}
		if other.registry_file.is_some() {
			self.registry_file = other.registry_file;
		}
		if other.strict_permissions.is_some() {
			self.strict_permissions = other.strict_permissions;
		}
	}

	pub fn finalize(self) -> EncryptionConfig {
		EncryptionConfig {
			enabled: self.enabled.unwrap_or(true),
			key_dir: self
				.key_dir
				.unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_DIR)),
			kek_file: self
				.kek_file
				.unwrap_or_else(|| PathBuf::from(DEFAULT_KEK_FILE)),
			dek_file: self
				.dek_file
				.unwrap_or_else(|| PathBuf::from(DEFAULT_DEK_FILE)),
			registry_file: self
				.registry_file
				.unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_FILE)),
			strict_permissions: self.strict_permissions.unwrap_or(true),
		}
	}
}

/// Where key material lives and whether encryption is turned on at all.
///
/// `kek_file`, `dek_file` and `registry_file` are resolved against `key_dir`
/// when relative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptionConfig {
	pub enabled: bool,
	pub key_dir: PathBuf,
	pub kek_file: PathBuf,
	pub dek_file: PathBuf,
	pub registry_file: PathBuf,
	/// Refuse to load key files whose mode is looser than 0600.
	pub strict_permissions: bool,
}

impl EncryptionConfig {
	/// Configuration rooted at `key_dir` with default file names.
	pub fn with_key_dir(key_dir: impl Into<PathBuf>) -> Self {
		Self {
			key_dir: key_dir.into(),
			..Self::default()
		}
	}

	pub fn kek_path(&self) -> PathBuf {
		resolve(&self.key_dir, &self.kek_file)
	}

	pub fn dek_path(&self) -> PathBuf {
		resolve(&self.key_dir, &self.dek_file)
	}

	pub fn registry_path(&self) -> PathBuf {
		resolve(&self.key_dir, &self.registry_file)
	}
}

impl Default for EncryptionConfig {
	fn default() -> Self {
		EncryptionConfigLayer::default().finalize()
	}
}

fn resolve(base: &Path, file: &Path) -> PathBuf {
	if file.is_absolute() {
		file.to_path_buf()
	} else {
		base.join(file)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_values() {
		let config = EncryptionConfig::default();
		assert!(config.enabled);
		assert!(config.strict_permissions);
		assert_eq!(config.key_dir, PathBuf::from(DEFAULT_KEY_DIR));
		assert_eq!(config.kek_path(), PathBuf::from("/var/lib/sealbox/keys/kek.key"));
		assert_eq!(config.dek_path(), PathBuf::from("/var/lib/sealbox/keys/dek.key"));
		assert_eq!(
			config.registry_path(),
			PathBuf::from("/var/lib/sealbox/keys/keys.json")
		);
	}

	#[test]
	fn test_absolute_file_paths_are_kept() {
		let config = EncryptionConfig {
			kek_file: PathBuf::from("/secure/root.key"),
			..EncryptionConfig::with_key_dir("/tmp/keys")
		};
		assert_eq!(config.kek_path(), PathBuf::from("/secure/root.key"));
		assert_eq!(config.dek_path(), PathBuf::from("/tmp/keys/dek.key"));
	}

	#[test]
	fn test_merge_overrides_only_set_fields() {
		let mut base = EncryptionConfigLayer {
			enabled: Some(true),
			key_dir: Some(PathBuf::from("/a")),
			..Default::default()
		};
		base.merge(EncryptionConfigLayer {
			enabled: Some(false),
			..Default::default()
		});
		assert_eq!(base.enabled, Some(false));
		assert_eq!(base.key_dir, Some(PathBuf::from("/a")));
	}
}
