// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Partial configuration produced by a single source.

use serde::{Deserialize, Serialize};

use crate::sections::{
	EncryptionConfigLayer, LoggingConfigLayer, PermissionsConfigLayer, RotationConfigLayer,
};

/// One source's view of the configuration; unset fields fall through to
/// lower-precedence sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SealboxConfigLayer {
	pub encryption: Option<EncryptionConfigLayer>,
	pub rotation: Option<RotationConfigLayer>,
	pub permissions: Option<PermissionsConfigLayer>,
	pub logging: Option<LoggingConfigLayer>,
}

impl SealboxConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_section(&mut self.encryption, other.encryption, EncryptionConfigLayer::merge);
		merge_section(&mut self.rotation, other.rotation, RotationConfigLayer::merge);
		merge_section(&mut self.permissions, other.permissions, PermissionsConfigLayer::merge);
		merge_section(&mut self.logging, other.logging, LoggingConfigLayer::merge);
	}
}

fn merge_section<T>(current: &mut Option<T>, incoming: Option<T>, merge: fn(&mut T, T)) {
	if let Some(other) = incoming {
		match current {
			Some(existing) => merge(existing, other),
			None => *current = Some(other),
		}
	}
}
