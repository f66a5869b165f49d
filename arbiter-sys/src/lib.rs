// SPDX-License-Identifier: GPL-3.0-only

//! Low-level host operations for the Disk Arbiter
//!
//! This crate provides the blocking host surface the engine delegates to its
//! worker threads:
//! - Live mount state from `/proc/self/mountinfo`
//! - Process lookup by open files under a mount point
//! - Block device discovery from sysfs
//! - A `blkid`-backed filesystem plugin that mounts through `mount(2)`
//!
//! Most of these operations require elevated privileges and should only be
//! called from the privileged daemon.

pub mod blkid;
pub mod discovery;
pub mod error;
pub mod host;
pub mod mounts;
pub mod process_finder;

pub use blkid::BlkidPlugin;
pub use discovery::{DeviceEvent, SysfsDiscovery};
pub use error::{Result, SysError};
pub use host::LinuxHost;
pub use mounts::{MountEntry, parse_mountinfo, unescape_mount_field};
pub use process_finder::{Holder, holders_of};
