// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Command handlers.
//!
//! The CLI has no access to the application's database, so `rotate` only
//! activates a new key. The rotation stays pending, with stored envelopes
//! still decrypting under their retired version, until the application
//! finishes it with `KeyService::resume_rotation_with_storage`.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context};
use sealbox_keys::{
	Envelope, EnvelopeIter, EnvelopeStorage, InitReport, KeyService, KeyVersion, PermissionReport,
	RotationRecord, StorageError, WrappedKey,
};
use serde::Serialize;
use tracing::{info, warn};

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
	let json = serde_json::to_string_pretty(value).context("serializing output")?;
	println!("{json}");
	Ok(())
}

pub fn init(service: &KeyService) -> anyhow::Result<InitReport> {
	let report = service.initialize().context("initializing key directory")?;
	if report.created_anything() {
		info!(?report, "key directory initialized");
	} else {
		info!("key directory already initialized");
	}
	Ok(report)
}

pub fn rotate(service: &KeyService) -> anyhow::Result<RotationRecord> {
	let record = service.rotate_key_only().context("rotating keys")?;
	warn!(
		rotation = record.id,
		retired = %record.from_version,
		active = %record.to_version,
		"stored envelopes still need migrating by the application"
	);
	Ok(record)
}

pub fn pending(service: &KeyService) -> anyhow::Result<RotationRecord> {
	match service
		.pending_rotation()
		.context("reading rotation records")?
	{
		Some(record) => Ok(record),
		None => bail!("no rotation is waiting for envelope migration"),
	}
}

pub fn validate(service: &KeyService) -> anyhow::Result<()> {
	if let Err(e) = service.validate() {
		for problem in &e.problems {
			eprintln!("{:?}: {problem}", problem.kind());
		}
		return Err(e.into());
	}
	Ok(())
}

pub fn audit_permissions(service: &KeyService) -> anyhow::Result<()> {
	let report = service.audit_permissions();
	print_json(&report)?;

	let violations = report.violations().count();
	if violations > 0 {
		bail!("{violations} path(s) have unsafe permissions; run `sealbox fix-perms`");
	}
	Ok(())
}

pub fn fix_permissions(service: &KeyService) -> anyhow::Result<PermissionReport> {
	service
		.fix_permissions()
		.context("fixing permissions")?;
	Ok(service.audit_permissions())
}

pub fn export_key(
	service: &KeyService,
	version: KeyVersion,
	output: Option<&Path>,
) -> anyhow::Result<()> {
	let wrapped = service
		.export_key(version)
		.with_context(|| format!("exporting key version {version}"))?;
	let json = serde_json::to_string_pretty(&wrapped).context("serializing wrapped key")?;

	match output {
		Some(path) => {
			let mut file = create_private_file(path)
				.with_context(|| format!("creating {}", path.display()))?;
			writeln!(file, "{json}").with_context(|| format!("writing {}", path.display()))?;
			info!(path = %path.display(), %version, "exported wrapped key");
		}
		None => println!("{json}"),
	}
	Ok(())
}

pub fn import_key(service: &KeyService, file: &Path) -> anyhow::Result<()> {
	let json = std::fs::read_to_string(file)
		.with_context(|| format!("reading {}", file.display()))?;
	let wrapped: WrappedKey = serde_json::from_str(&json)
		.with_context(|| format!("parsing wrapped key in {}", file.display()))?;

	service
		.import_key(&wrapped)
		.with_context(|| format!("importing key version {}", wrapped.version))?;
	info!(version = %wrapped.version, "imported wrapped key");
	Ok(())
}

pub fn purge(
	service: &KeyService,
	version: KeyVersion,
	no_stored_envelopes: bool,
) -> anyhow::Result<()> {
	if !no_stored_envelopes {
		bail!(
			"the CLI cannot see stored envelopes; purge from the application, \
			 or pass --no-stored-envelopes if nothing references version {version}"
		);
	}
	service
		.purge_retired(version, &NoStoredEnvelopes)
		.with_context(|| format!("purging key version {version}"))?;
	info!(%version, "purged key version");
	Ok(())
}

/// Storage for an operator who has confirmed nothing is stored.
struct NoStoredEnvelopes;

impl EnvelopeStorage for NoStoredEnvelopes {
	fn enumerate_envelopes_by_key_version(
		&self,
		_version: KeyVersion,
	) -> Result<EnvelopeIter<'_>, StorageError> {
		Ok(Box::new(std::iter::empty()))
	}

	fn rewrite_envelope(&self, record_id: &str, _envelope: Envelope) -> Result<(), StorageError> {
		Err(StorageError::new(format!(
			"no storage attached; cannot rewrite {record_id}"
		)))
	}
}

#[cfg(unix)]
fn create_private_file(path: &Path) -> std::io::Result<std::fs::File> {
	use std::os::unix::fs::OpenOptionsExt;

	std::fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.mode(0o600)
		.open(path)
}

#[cfg(not(unix))]
fn create_private_file(path: &Path) -> std::io::Result<std::fs::File> {
	std::fs::OpenOptions::new()
		.write(true)
		.create_new(true)
		.open(path)
}
