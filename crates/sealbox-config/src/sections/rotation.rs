// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key rotation configuration section.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_RECORD_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RotationConfigLayer {
	pub batch_size: Option<usize>,
	pub max_record_attempts: Option<u32>,
}

impl RotationConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.batch_size.is_some() {
			self.batch_size = other.batch_size;
		}
		if other.max_record_attempts.is_some() {
			self.max_record_attempts = other.max_record_attempts;
		}
	}

	pub fn finalize(self) -> Result<RotationConfig, ConfigError> {
		let config = RotationConfig {
			batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
			max_record_attempts: self
				.max_record_attempts
				.unwrap_or(DEFAULT_MAX_RECORD_ATTEMPTS),
		};

		if config.batch_size == 0 {
			return Err(ConfigError::invalid_value(
				"rotation.batch_size",
				"must be greater than zero",
			));
		}
		if config.max_record_attempts == 0 {
			return Err(ConfigError::invalid_value(
				"rotation.max_record_attempts",
				"must be greater than zero",
			));
		}

		Ok(config)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RotationConfig {
	/// Records re-encrypted per batch during migration.
	pub batch_size: usize,
	/// Attempts per record before it is reported as failed.
	pub max_record_attempts: u32,
}

impl Default for RotationConfig {
	fn default() -> Self {
		Self {
			batch_size: DEFAULT_BATCH_SIZE,
			max_record_attempts: DEFAULT_MAX_RECORD_ATTEMPTS,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_values() {
		let config = RotationConfigLayer::default().finalize().unwrap();
		assert_eq!(config, RotationConfig::default());
		assert_eq!(config.batch_size, 100);
		assert_eq!(config.max_record_attempts, 3);
	}

	#[test]
	fn test_zero_batch_size_rejected() {
		let layer = RotationConfigLayer {
			batch_size: Some(0),
			..Default::default()
		};
		let err = layer.finalize().unwrap_err();
		assert!(err.to_string().contains("rotation.batch_size"));
	}

	#[test]
	fn test_zero_attempts_rejected() {
		let layer = RotationConfigLayer {
			max_record_attempts: Some(0),
			..Default::default()
		};
		assert!(layer.finalize().is_err());
	}
}
