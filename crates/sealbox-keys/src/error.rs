// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for key storage, encryption and rotation.
//!
//! Every error reports an [`ErrorKind`] so callers can tell tampered data
//! apart from a key version that is simply absent on this host without
//! parsing messages.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::migrate::MigrationReport;
use crate::rotation::{RecordFailure, RotationRecord};
use crate::version::{KeyKind, KeyVersion};

/// Stable classification of every error in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	KeyNotFound,
	InvalidKeySize,
	PermissionViolation,
	DecryptionFailed,
	RotationInProgress,
	RotationFailed,
	Io,
	EncryptionDisabled,
	NotInitialized,
	MalformedEnvelope,
	Registry,
	Storage,
	InvalidState,
}

/// Errors from loading, generating or persisting key material.
#[derive(Debug, Error)]
pub enum KeyError {
	#[error("{kind} version {version} not found at {path}")]
	KeyNotFound {
		kind: KeyKind,
		version: KeyVersion,
		path: PathBuf,
	},

	#[error("invalid key size: expected {expected} bytes, got {actual}")]
	InvalidKeySize {
		expected: usize,
		actual: u64,
		path: Option<PathBuf>,
	},

	#[error("key file {path} has mode {actual:04o}, expected {expected:04o} or stricter")]
	PermissionViolation {
		path: PathBuf,
		actual: u32,
		expected: u32,
	},

	#[error("key file {path} is owned by uid {actual}, expected uid {expected}")]
	OwnershipMismatch {
		path: PathBuf,
		actual: u32,
		expected: u32,
	},

	#[error("key file already exists: {path}")]
	AlreadyExists { path: PathBuf },

	#[error("expected {expected} key material, got {actual}")]
	WrongKind { expected: KeyKind, actual: KeyKind },

	#[error("failed to wrap DEK version {version}")]
	WrapFailed { version: KeyVersion },

	#[error("failed to unwrap DEK version {version}: authentication failed")]
	UnwrapFailed { version: KeyVersion },

	#[error("cannot restore DEK version {version}: {reason}")]
	RestoreRejected { version: KeyVersion, reason: String },

	#[error("encryption is disabled by configuration")]
	Disabled,

	#[error("key store is not initialized")]
	NotInitialized,

	#[error("registry error: {0}")]
	Registry(#[from] RegistryError),

	#[error("I/O error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

impl KeyError {
	pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}

	pub fn kind(&self) -> ErrorKind {
		match self {
			KeyError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
			KeyError::InvalidKeySize { .. } => ErrorKind::InvalidKeySize,
			KeyError::PermissionViolation { .. } | KeyError::OwnershipMismatch { .. } => {
				ErrorKind::PermissionViolation
			}
			KeyError::UnwrapFailed { .. } => ErrorKind::DecryptionFailed,
			KeyError::AlreadyExists { .. }
			| KeyError::WrapFailed { .. }
			| KeyError::WrongKind { .. }
			| KeyError::RestoreRejected { .. } => ErrorKind::InvalidState,
			KeyError::Disabled => ErrorKind::EncryptionDisabled,
			KeyError::NotInitialized => ErrorKind::NotInitialized,
			KeyError::Registry(err) => err.kind(),
			KeyError::Io { .. } => ErrorKind::Io,
		}
	}
}

/// Every problem found by a full key validation pass.
#[derive(Debug, Error)]
#[error("key validation failed with {} problem(s)", .problems.len())]
pub struct ValidationError {
	pub problems: Vec<KeyError>,
}

impl ValidationError {
	pub fn kind(&self) -> ErrorKind {
		self.problems
			.first()
			.map(KeyError::kind)
			.unwrap_or(ErrorKind::InvalidState)
	}
}

/// Errors from repairing file permissions.
#[derive(Debug, Error)]
pub enum PermissionError {
	#[error("failed to update permissions on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to change owner of {path} to uid {uid}: {source}")]
	Ownership {
		path: PathBuf,
		uid: u32,
		#[source]
		source: std::io::Error,
	},
}

impl PermissionError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			PermissionError::Io { .. } => ErrorKind::Io,
			PermissionError::Ownership { .. } => ErrorKind::PermissionViolation,
		}
	}
}

/// Errors from encrypting or decrypting envelopes.
#[derive(Debug, Error)]
pub enum CryptoError {
	#[error("encryption is disabled by configuration")]
	Disabled,

	/// Authentication tag mismatch. Deliberately carries no detail.
	#[error("decryption failed")]
	DecryptionFailed,

	#[error("encryption failed")]
	EncryptionFailed,

	#[error("malformed envelope: {0}")]
	MalformedEnvelope(String),

	#[error(transparent)]
	Key(#[from] KeyError),

	#[error(transparent)]
	Registry(#[from] RegistryError),
}

impl CryptoError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			CryptoError::Disabled => ErrorKind::EncryptionDisabled,
			CryptoError::DecryptionFailed => ErrorKind::DecryptionFailed,
			CryptoError::EncryptionFailed => ErrorKind::InvalidState,
			CryptoError::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
			CryptoError::Key(err) => err.kind(),
			CryptoError::Registry(err) => err.kind(),
		}
	}
}

/// Errors from the key version registry.
#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("key registry is not initialized")]
	NotInitialized,

	#[error("key registry is already initialized")]
	AlreadyInitialized,

	#[error("unknown key version {0}")]
	UnknownVersion(KeyVersion),

	#[error("key version {version} is not newer than latest version {latest}")]
	NonMonotonic {
		version: KeyVersion,
		latest: KeyVersion,
	},

	#[error("key version {0} is active and cannot be removed")]
	ActiveVersion(KeyVersion),

	#[error("invalid registry {path}: {reason}")]
	Invalid { path: PathBuf, reason: String },

	#[error("failed to parse registry {path}: {source}")]
	Corrupt {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("registry I/O error on {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

impl RegistryError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			RegistryError::NotInitialized => ErrorKind::NotInitialized,
			RegistryError::UnknownVersion(_) => ErrorKind::KeyNotFound,
			RegistryError::Io { .. } => ErrorKind::Io,
			RegistryError::AlreadyInitialized
			| RegistryError::NonMonotonic { .. }
			| RegistryError::ActiveVersion(_) => ErrorKind::InvalidState,
			RegistryError::Invalid { .. } | RegistryError::Corrupt { .. } => ErrorKind::Registry,
		}
	}
}

/// Failure reported by the storage collaborator.
#[derive(Debug, Clone, Error)]
#[error("storage error: {message}")]
pub struct StorageError {
	pub message: String,
	/// Worth retrying (lock timeouts, busy database, interrupted I/O).
	pub transient: bool,
}

impl StorageError {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			transient: false,
		}
	}

	pub fn transient(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			transient: true,
		}
	}
}

/// A migration callback that could not finish its pass.
#[derive(Debug, Error)]
pub enum MigrationError {
	/// Enumeration broke off; `partial` holds what was done before.
	#[error("migration interrupted: {source}")]
	Interrupted {
		#[source]
		source: StorageError,
		partial: MigrationReport,
	},

	#[error("migration aborted: {0}")]
	Aborted(String),
}

/// Errors from rotation, resume and purge.
#[derive(Debug, Error)]
pub enum RotationError {
	#[error("encryption is disabled by configuration")]
	Disabled,

	#[error("another rotation is in progress")]
	InProgress,

	#[error(
		"rotation {} from version {} to {} failed: {}",
		.record.id,
		.record.from_version,
		.record.to_version,
		.record.last_error.as_deref().unwrap_or("migration incomplete")
	)]
	Failed {
		record: Box<RotationRecord>,
		failures: Vec<RecordFailure>,
	},

	#[error("no failed or interrupted rotation to resume")]
	NothingToResume,

	#[error("rotation target version {to_version} is no longer active (active is {active})")]
	StaleRotation {
		to_version: KeyVersion,
		active: KeyVersion,
	},

	#[error("key version {version} is still referenced by stored envelopes")]
	VersionInUse { version: KeyVersion },

	#[error("failed to acquire rotation lock {path}: {source}")]
	Lock {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error(transparent)]
	Key(#[from] KeyError),

	#[error(transparent)]
	Registry(#[from] RegistryError),

	#[error(transparent)]
	Storage(#[from] StorageError),
}

impl RotationError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			RotationError::Disabled => ErrorKind::EncryptionDisabled,
			RotationError::InProgress => ErrorKind::RotationInProgress,
			RotationError::Failed { .. } => ErrorKind::RotationFailed,
			RotationError::NothingToResume
			| RotationError::StaleRotation { .. }
			| RotationError::VersionInUse { .. } => ErrorKind::InvalidState,
			RotationError::Lock { .. } => ErrorKind::Io,
			RotationError::Key(err) => err.kind(),
			RotationError::Registry(err) => err.kind(),
			RotationError::Storage(_) => ErrorKind::Storage,
		}
	}

	/// The rotation record for a failed rotation, including partial progress.
	pub fn record(&self) -> Option<&RotationRecord> {
		match self {
			RotationError::Failed { record, .. } => Some(record),
			_ => None,
		}
	}
}
