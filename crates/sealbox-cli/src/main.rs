// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Operator commands for a sealbox key directory.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sealbox_config::{LogFormat, LoggingConfig, SealboxConfig};
use sealbox_keys::{KeyService, KeyVersion};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// sealbox - envelope encryption keys for stored secrets and auth tokens.
#[derive(Parser, Debug)]
#[command(
	name = "sealbox",
	about = "Manage sealbox encryption keys",
	version
)]
struct Args {
	/// Config file to load instead of /etc/sealbox/sealbox.toml
	#[arg(long, short, env = "SEALBOX_CONFIG_FILE", global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Create the KEK, the first DEK and the key registry if absent
	Init,
	/// Show whether encryption is enabled and which key version is active
	Status,
	/// Generate a new DEK version and make it active; the application migrates stored envelopes
	Rotate,
	/// Show the rotation whose stored envelopes still need migrating
	Pending,
	/// Check key files, sizes, permissions and registry consistency
	Validate,
	/// Report key and data files with unsafe permissions
	AuditPerms,
	/// Tighten key and data file permissions
	FixPerms,
	/// Write a DEK version wrapped under the KEK, for backup
	ExportKey {
		#[arg(long = "key-version")]
		key_version: KeyVersion,

		/// Write here instead of stdout
		#[arg(long, short)]
		output: Option<PathBuf>,
	},
	/// Restore a DEK version from an exported backup
	ImportKey {
		file: PathBuf,
	},
	/// Delete a retired DEK version
	Purge {
		#[arg(long = "key-version")]
		key_version: KeyVersion,

		/// Confirm that no stored envelope references this version
		#[arg(long)]
		no_stored_envelopes: bool,
	},
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let config = load_config(args.config.as_deref())?;
	init_tracing(&config.logging);

	let service = KeyService::open(&config).context("opening key directory")?;
	run(args.command, &service)
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<SealboxConfig> {
	let config = match path {
		Some(path) => sealbox_config::load_config_with_file(path)
			.with_context(|| format!("loading configuration from {}", path.display()))?,
		None => sealbox_config::load_config().context("loading configuration")?,
	};
	Ok(config)
}

/// Logs go to stderr; stdout carries command output.
fn init_tracing(logging: &LoggingConfig) {
	let registry = tracing_subscriber::registry().with(
		tracing_subscriber::EnvFilter::try_from_default_env()
			.unwrap_or_else(|_| logging.level.clone().into()),
	);

	match logging.format {
		LogFormat::Json => registry
			.with(
				tracing_subscriber::fmt::layer()
					.json()
					.with_writer(std::io::stderr),
			)
			.init(),
		LogFormat::Text => registry
			.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
			.init(),
	}
}

fn run(command: Command, service: &KeyService) -> anyhow::Result<()> {
	match command {
		Command::Init => commands::print_json(&commands::init(service)?),
		Command::Status => commands::print_json(&service.status()),
		Command::Rotate => commands::print_json(&commands::rotate(service)?),
		Command::Pending => commands::print_json(&commands::pending(service)?),
		Command::Validate => {
			commands::validate(service)?;
			println!("ok");
			Ok(())
		}
		Command::AuditPerms => commands::audit_permissions(service),
		Command::FixPerms => commands::print_json(&commands::fix_permissions(service)?),
		Command::ExportKey {
			key_version,
			output,
		} => commands::export_key(service, key_version, output.as_deref()),
		Command::ImportKey { file } => commands::import_key(service, &file),
		Command::Purge {
			key_version,
			no_stored_envelopes,
		} => commands::purge(service, key_version, no_stored_envelopes),
	}
}
