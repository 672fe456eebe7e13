// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Envelope encryption and key lifecycle for stored secrets and auth tokens.
//!
//! This crate provides:
//! - A key store holding the KEK and every DEK version as 32 byte files (mode 0600)
//! - AES-256-GCM envelopes that record the key version they were sealed with
//! - A key version registry with exactly one active version
//! - Rotation with resumable, idempotent re-encryption of stored envelopes
//! - Permission audit and repair for key files and other sensitive files
//!
//! # Usage
//!
//! ```ignore
//! use sealbox_keys::KeyService;
//!
//! let service = KeyService::open(&sealbox_config::load_config()?)?;
//! service.initialize()?;
//!
//! let envelope = service.encrypt(b"hello", None)?;
//! let (ciphertext, metadata) = envelope.into_parts()?;
//! ```

pub mod cipher;
pub mod envelope;
pub mod error;
mod fsutil;
pub mod lock;
pub mod lookup;
pub mod material;
pub mod migrate;
pub mod permissions;
pub mod registry;
pub mod rotation;
pub mod service;
pub mod store;
pub mod version;
pub mod wrap;

pub use cipher::EnvelopeCipher;
pub use envelope::{Algorithm, Envelope, EnvelopeMetadata, RecordKind};
pub use error::{
	CryptoError, ErrorKind, KeyError, MigrationError, PermissionError, RegistryError,
	RotationError, StorageError, ValidationError,
};
pub use lookup::LookupHasher;
pub use material::{KeyMaterial, KEY_SIZE};
pub use migrate::{EnvelopeIter, EnvelopeStorage, MigrationReport, StorageMigrator};
pub use permissions::{FilePermissionGuard, PermissionFinding, PermissionIssue, PermissionReport};
pub use registry::{KeyVersionRegistry, RegistryEntry, VersionStatus};
pub use rotation::{
	MigrationProgress, MigrationRequest, RecordFailure, RotationCoordinator, RotationPhase,
	RotationRecord, RotationStatus,
};
pub use service::{KeyService, KeyStatus};
pub use store::{InitReport, KeyMaterialStore, KeyPaths};
pub use version::{InvalidKeyVersion, KeyId, KeyKind, KeyVersion};
pub use wrap::WrappedKey;
