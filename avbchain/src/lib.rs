// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Tools for checking and repairing Android Verified Boot chains of trust.
//!
//! [`verify::recursive_verify`] walks a set of partitions starting from the
//! root vbmeta partition and reports everything that does not match.
//! [`rebuild::rebuild_with_trusted_data`] turns those findings into new,
//! re-signed vbmeta images that can be written back to the partitions.
//!
//! The semver versioning covers the CLI only. All Rust APIs can change at any
//! time, even in patch releases.

pub mod cli;
pub mod crypto;
pub mod format;
pub mod keyring;
pub mod partition;
pub mod rebuild;
pub mod stream;
pub mod util;
pub mod verify;
