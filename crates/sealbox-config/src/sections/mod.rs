// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sections.

mod encryption;
mod logging;
mod permissions;
mod rotation;

pub use encryption::*;
pub use logging::*;
pub use permissions::*;
pub use rotation::*;
