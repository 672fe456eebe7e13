// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: environment variables and TOML files.

use std::path::PathBuf;

use tracing::{debug, trace};

use crate::error::ConfigError;
use crate::layer::SealboxConfigLayer;
use crate::sections::{
	EncryptionConfigLayer, LogFormat, LoggingConfigLayer, PermissionsConfigLayer,
	RotationConfigLayer,
};

/// Default location of the system-wide config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sealbox/sealbox.toml";

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

/// Trait for configuration sources.
pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<SealboxConfigLayer, ConfigError>;
}

/// Built-in defaults source.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<SealboxConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(SealboxConfigLayer::default())
	}
}

/// TOML file configuration source.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new(SYSTEM_CONFIG_PATH)
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<SealboxConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(SealboxConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: SealboxConfigLayer =
			toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
				path: self.path.clone(),
				source: e,
			})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

/// Environment variable source.
///
/// Convention: SEALBOX_<SECTION>_<FIELD>
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<SealboxConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(SealboxConfigLayer {
			encryption: Some(load_encryption_from_env()?),
			rotation: Some(load_rotation_from_env()?),
			permissions: Some(load_permissions_from_env()?),
			logging: Some(load_logging_from_env()?),
		})
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
	env_var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid u32 value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_usize(name: &str) -> Result<Option<usize>, ConfigError> {
	match env_var(name) {
		Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
			key: name.to_string(),
			message: format!("invalid integer value '{v}'"),
		}),
		None => Ok(None),
	}
}

fn env_path(name: &str) -> Option<PathBuf> {
	env_var(name).map(PathBuf::from)
}

fn load_encryption_from_env() -> Result<EncryptionConfigLayer, ConfigError> {
	Ok(EncryptionConfigLayer {
		enabled: env_bool("SEALBOX_ENCRYPTION_ENABLED"),
		key_dir: env_path("SEALBOX_ENCRYPTION_KEY_DIR"),
		kek_file: env_path("SEALBOX_ENCRYPTION_KEK_FILE"),
		dek_file: env_path("SEALBOX_ENCRYPTION_DEK_FILE"),
		registry_file: env_path("SEALBOX_ENCRYPTION_REGISTRY_FILE"),
		strict_permissions: env_bool("SEALBOX_ENCRYPTION_STRICT_PERMISSIONS"),
	})
}

fn load_rotation_from_env() -> Result<RotationConfigLayer, ConfigError> {
	Ok(RotationConfigLayer {
		batch_size: env_usize("SEALBOX_ROTATION_BATCH_SIZE")?,
		max_record_attempts: env_u32("SEALBOX_ROTATION_MAX_RECORD_ATTEMPTS")?,
	})
}

fn load_permissions_from_env() -> Result<PermissionsConfigLayer, ConfigError> {
	let extra_paths = env_var("SEALBOX_PERMISSIONS_EXTRA_PATHS").map(|s| {
		s.split(',')
			.map(|s| s.trim())
			.filter(|s| !s.is_empty())
			.map(PathBuf::from)
			.collect()
	});

	Ok(PermissionsConfigLayer {
		owner_uid: env_u32("SEALBOX_PERMISSIONS_OWNER_UID")?,
		extra_paths,
	})
}

fn load_logging_from_env() -> Result<LoggingConfigLayer, ConfigError> {
	let format = match env_var("SEALBOX_LOG_FORMAT") {
		Some(v) => Some(v.parse::<LogFormat>().map_err(|message| ConfigError::InvalidValue {
			key: "SEALBOX_LOG_FORMAT".to_string(),
			message,
		})?),
		None => None,
	};

	Ok(LoggingConfigLayer {
		level: env_var("SEALBOX_LOG_LEVEL"),
		format,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn test_precedence_ordering() {
		assert!(Precedence::Environment > Precedence::ConfigFile);
		assert!(Precedence::ConfigFile > Precedence::Defaults);
	}

	#[test]
	fn test_defaults_source_returns_empty_layer() {
		let source = DefaultsSource;
		let layer = source.load().unwrap();
		assert!(layer.encryption.is_none());
		assert!(layer.rotation.is_none());
	}

	#[test]
	fn test_toml_source_missing_file_returns_empty() {
		let source = TomlSource::new("/nonexistent/sealbox.toml");
		let layer = source.load().unwrap();
		assert!(layer.encryption.is_none());
	}

	#[test]
	fn test_toml_source_parses_sections() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(
			file,
			r#"
[encryption]
enabled = false
key_dir = "/srv/keys"

[rotation]
batch_size = 25

[logging]
format = "json"
"#
		)
		.unwrap();

		let layer = TomlSource::new(file.path()).load().unwrap();
		let encryption = layer.encryption.unwrap();
		assert_eq!(encryption.enabled, Some(false));
		assert_eq!(encryption.key_dir, Some(PathBuf::from("/srv/keys")));
		assert_eq!(layer.rotation.unwrap().batch_size, Some(25));
		assert_eq!(layer.logging.unwrap().format, Some(LogFormat::Json));
	}

	#[test]
	fn test_toml_source_reports_parse_errors() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "[encryption\nenabled = ").unwrap();

		let err = TomlSource::new(file.path()).load().unwrap_err();
		assert!(matches!(err, ConfigError::TomlParse { .. }));
	}
}
