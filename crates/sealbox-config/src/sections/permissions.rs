// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! File permission audit configuration section.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionsConfigLayer {
	pub owner_uid: Option<u32>,
	pub extra_paths: Option<Vec<PathBuf>>,
}

impl PermissionsConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.owner_uid.is_some() {
			self.owner_uid = other.owner_uid;
		}
		if other.extra_paths.is_some() {
			self.extra_paths = other.extra_paths;
		}
	}

	pub fn finalize(self) -> PermissionsConfig {
		PermissionsConfig {
			owner_uid: self.owner_uid,
			extra_paths: self.extra_paths.unwrap_or_default(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionsConfig {
	/// Expected owner of key files. `None` means the effective uid of the process.
	pub owner_uid: Option<u32>,
	/// Additional sensitive files (database files, env files) audited alongside keys.
	pub extra_paths: Vec<PathBuf>,
}
