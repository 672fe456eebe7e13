// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration for the sealbox key store.
//!
//! This crate provides:
//! - Layered configuration from multiple sources (defaults, TOML file, environment)
//! - Type-safe configuration with validation
//! - Consistent environment variable naming (`SEALBOX_*`)
//!
//! # Usage
//!
//! ```ignore
//! use sealbox_config::load_config;
//!
//! let config = load_config()?;
//! println!("keys live in {}", config.encryption.key_dir.display());
//! ```

pub mod error;
pub mod layer;
pub mod sections;
pub mod sources;

pub use error::ConfigError;
pub use layer::SealboxConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use tracing::{debug, info};

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SealboxConfig {
	pub encryption: EncryptionConfig,
	pub rotation: RotationConfig,
	pub permissions: PermissionsConfig,
	pub logging: LoggingConfig,
}

/// Load configuration from all sources with standard precedence.
///
/// Precedence (highest to lowest):
/// 1. Environment variables (`SEALBOX_*`)
/// 2. Config file (`/etc/sealbox/sealbox.toml`)
/// 3. Built-in defaults
pub fn load_config() -> Result<SealboxConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource),
	])
}

/// Load configuration from environment only (for testing or simple deployments).
pub fn load_config_from_env() -> Result<SealboxConfig, ConfigError> {
	load_from_sources(vec![Box::new(DefaultsSource), Box::new(EnvSource)])
}

/// Load configuration with a custom config file path.
pub fn load_config_with_file(
	config_path: impl Into<std::path::PathBuf>,
) -> Result<SealboxConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource),
	])
}

fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<SealboxConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = SealboxConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		let layer = source.load()?;
		merged.merge(layer);
	}

	finalize(merged)
}

/// Finalize configuration layer into resolved config.
pub fn finalize(layer: SealboxConfigLayer) -> Result<SealboxConfig, ConfigError> {
	let encryption = layer.encryption.unwrap_or_default().finalize();
	let rotation = layer.rotation.unwrap_or_default().finalize()?;
	let permissions = layer.permissions.unwrap_or_default().finalize();
	let logging = layer.logging.unwrap_or_default().finalize();

	validate_config(&encryption)?;

	info!(
		enabled = encryption.enabled,
		key_dir = %encryption.key_dir.display(),
		strict_permissions = encryption.strict_permissions,
		batch_size = rotation.batch_size,
		"sealbox configuration loaded"
	);

	Ok(SealboxConfig {
		encryption,
		rotation,
		permissions,
		logging,
	})
}

/// Validate cross-field configuration rules.
fn validate_config(encryption: &EncryptionConfig) -> Result<(), ConfigError> {
	if encryption.kek_path() == encryption.dek_path() {
		return Err(ConfigError::Validation(
			"encryption.kek_file and encryption.dek_file resolve to the same path".to_string(),
		));
	}
	if encryption.registry_path() == encryption.kek_path()
		|| encryption.registry_path() == encryption.dek_path()
	{
		return Err(ConfigError::Validation(
			"encryption.registry_file must not share a path with a key file".to_string(),
		));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	#[test]
	fn test_finalize_defaults() {
		let config = finalize(SealboxConfigLayer::default()).unwrap();
		assert_eq!(config, SealboxConfig::default());
		assert!(config.encryption.enabled);
		assert_eq!(config.logging.level, "info");
	}

	#[test]
	fn test_same_kek_and_dek_path_rejected() {
		let layer = SealboxConfigLayer {
			encryption: Some(EncryptionConfigLayer {
				kek_file: Some(PathBuf::from("shared.key")),
				dek_file: Some(PathBuf::from("shared.key")),
				..Default::default()
			}),
			..Default::default()
		};
		let err = finalize(layer).unwrap_err();
		assert!(err.to_string().contains("same path"));
	}

	#[test]
	fn test_registry_colliding_with_key_rejected() {
		let layer = SealboxConfigLayer {
			encryption: Some(EncryptionConfigLayer {
				registry_file: Some(PathBuf::from("kek.key")),
				..Default::default()
			}),
			..Default::default()
		};
		assert!(finalize(layer).is_err());
	}

	#[test]
	fn test_file_layer_overrides_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("sealbox.toml");
		std::fs::write(&path, "[encryption]\nkey_dir = \"/opt/keys\"\n").unwrap();

		let mut merged = DefaultsSource.load().unwrap();
		merged.merge(TomlSource::new(&path).load().unwrap());
		let config = finalize(merged).unwrap();

		assert_eq!(config.encryption.key_dir, PathBuf::from("/opt/keys"));
		assert_eq!(config.encryption.kek_path(), PathBuf::from("/opt/keys/kek.key"));
	}
}
